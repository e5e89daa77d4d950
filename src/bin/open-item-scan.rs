use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

use openslot::browser::chromium::ChromiumDom;
use openslot::core::config;
use openslot::engine::clock::{Clock, Pacer, SystemClock};
use openslot::features::artifacts::{self, FileArtifacts};
use openslot::features::auth::login_if_configured;
use openslot::features::invoker::Invoker;
use openslot::features::scanner::{default_listings, scan_listings, ScanSummary};
use openslot::EngineError;

/// `--listing URL` may repeat; without it the default listing pages of the
/// configured target's site are swept.
fn listing_args() -> Vec<String> {
    let mut out = Vec::new();
    let mut args = std::env::args();
    while let Some(a) = args.next() {
        if a == "--listing" {
            if let Some(v) = args.next() {
                out.push(v);
            }
        } else if let Some(rest) = a.strip_prefix("--listing=") {
            out.push(rest.to_string());
        }
    }
    out
}

fn config_arg() -> Option<PathBuf> {
    let mut args = std::env::args();
    while let Some(a) = args.next() {
        if a == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(rest) = a.strip_prefix("--config=") {
            return Some(PathBuf::from(rest));
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cfg = config::load_engine_config(config_arg().as_deref())?.unwrap_or_default();
    let mut listings = listing_args();
    if listings.is_empty() {
        let base = cfg
            .target_url
            .as_deref()
            .or(cfg.login_url.as_deref())
            .context("pass --listing URL or configure target_url")?;
        listings = default_listings(base);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pacer = Pacer::unattended(clock.clone());
    let started = clock.now();
    let stamp = started.format("%Y%m%d_%H%M%S").to_string();
    let sink = FileArtifacts::create(&cfg.artifacts_dir, started).await?;

    let mut dom = ChromiumDom::launch(&cfg.browser).await?;
    let inv = Invoker::new(&cfg.timing, &pacer);
    let result: Result<ScanSummary, EngineError> = async {
        login_if_configured(&cfg, &mut dom, &inv).await?;
        scan_listings(&mut dom, &inv, &sink, &listings, &stamp, cfg.timing.probe_dialog_timeout()).await
    }
    .await;
    dom.close().await;

    let summary = result?;
    let value = serde_json::to_value(&summary)?;
    artifacts::write_json_best_effort(&sink, &format!("open_scan_{stamp}.json"), &value).await;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
