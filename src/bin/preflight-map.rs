use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use openslot::browser::chromium::ChromiumDom;
use openslot::core::config::{self, EngineConfig};
use openslot::engine::clock::{Clock, Pacer, SystemClock};
use openslot::features::artifacts::FileArtifacts;
use openslot::features::auth::login_if_configured;
use openslot::features::direct_apply::item_id;
use openslot::features::invoker::Invoker;
use openslot::features::preflight::{preflight_map, REQUEST_TIMEOUT};
use openslot::{AppState, DomProvider, EngineError};

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

/// Log in with a throwaway browser and copy its cookies.
async fn session_cookie(cfg: &EngineConfig, pacer: &Pacer) -> anyhow::Result<String> {
    let mut dom = ChromiumDom::launch(&cfg.browser).await?;
    let inv = Invoker::new(&cfg.timing, pacer);
    let result: Result<String, EngineError> = async {
        login_if_configured(cfg, &mut dom, &inv).await?;
        Ok(dom.cookie_header().await?)
    }
    .await;
    dom.close().await;
    Ok(result?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let explicit = arg_value("--config").map(PathBuf::from);
    let cfg = config::load_engine_config(explicit.as_deref())?.unwrap_or_default();
    let target = cfg.target_url.clone().unwrap_or_default();
    let sn = match arg_value("--sn") {
        Some(sn) => sn,
        None => item_id(&target, &cfg.direct_apply.id_params)
            .map(|(_, id)| id)
            .context("pass --sn or configure a target_url carrying the item id")?,
    };
    let base = match arg_value("--base") {
        Some(b) => b,
        None => url::Url::parse(&target)
            .map(|u| u.origin().ascii_serialization())
            .context("pass --base or configure target_url")?,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pacer = Pacer::unattended(clock.clone());
    let sink = FileArtifacts::create(&cfg.artifacts_dir, clock.now()).await?;

    let cookie = if std::env::args().any(|a| a == "--no-browser") {
        String::new()
    } else {
        match session_cookie(&cfg, &pacer).await {
            Ok(c) => c,
            Err(e) => {
                warn!("preflight: continuing without session cookies: {:#}", e);
                String::new()
            }
        }
    };

    let client = AppState::build_http_client(REQUEST_TIMEOUT)?;
    let report = preflight_map(&client, &sink, &base, &sn, &cookie, clock.now()).await?;
    let with_form = report.results.iter().filter(|r| r.has_form == Some(true)).count();
    eprintln!(
        "[preflight] {} path(s) checked, {} with a form; map and bodies under {}",
        report.results.len(),
        with_form,
        sink.dir().display()
    );
    Ok(())
}
