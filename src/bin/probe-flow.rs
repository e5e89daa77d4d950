use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

use openslot::browser::chromium::ChromiumDom;
use openslot::core::config;
use openslot::engine::clock::{Clock, Pacer, SystemClock};
use openslot::features::artifacts::FileArtifacts;
use openslot::features::auth::login_if_configured;
use openslot::features::invoker::Invoker;
use openslot::features::probe::{probe_flow, ProbeReport};
use openslot::EngineError;

fn arg_value(name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    let mut args = std::env::args();
    while let Some(a) = args.next() {
        if a == name {
            return args.next();
        }
        if let Some(rest) = a.strip_prefix(&prefix) {
            return Some(rest.to_string());
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let explicit = arg_value("--config").map(PathBuf::from);
    let mut cfg = config::load_engine_config(explicit.as_deref())?.unwrap_or_default();
    if let Some(url) = arg_value("--target-url") {
        cfg.target_url = Some(url);
    }
    if std::env::args().any(|a| a == "--no-headless") {
        cfg.browser.headless = false;
    }
    let target = cfg
        .target_url
        .clone()
        .context("target_url is required (config file or --target-url)")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pacer = Pacer::unattended(clock.clone());
    let started = clock.now();
    let stamp = started.format("%Y%m%d_%H%M%S").to_string();
    let sink = FileArtifacts::create(&cfg.artifacts_dir, started).await?;

    let mut dom = ChromiumDom::launch(&cfg.browser).await?;
    let inv = Invoker::new(&cfg.timing, &pacer);
    let result: Result<ProbeReport, EngineError> = async {
        login_if_configured(&cfg, &mut dom, &inv).await?;
        probe_flow(&mut dom, &inv, &sink, &target, &stamp, cfg.timing.probe_dialog_timeout()).await
    }
    .await;
    dom.close().await;

    let report = result?;
    if report.post.is_none() {
        eprintln!("[probe] no actionable apply control on {}", target);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!("[probe] artifacts under {}/probe_{}_*", sink.dir().display(), stamp);
    Ok(())
}
