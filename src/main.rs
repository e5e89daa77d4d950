use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use openslot::core::config::{self, EngineConfig, ENV_CONFIG_PATH};
use openslot::engine::clock::{Clock, Pacer, SystemClock};
use openslot::features::artifacts::FileArtifacts;
use openslot::{AppState, ChromiumSessions, EngineError, PollState, Runner};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    start_at: Option<String>,
    target_url: Option<String>,
    max_restarts: Option<u32>,
    no_headless: bool,
}

/// `--flag value` and `--flag=value` both work. Unknown arguments are ignored
/// with a warning.
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut out = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(a) = args.next() {
        let (key, inline) = match a.split_once('=') {
            Some((k, v)) if k.starts_with("--") => (k.to_string(), Some(v.to_string())),
            _ => (a.clone(), None),
        };
        let mut value = |name: &str| -> anyhow::Result<String> {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| anyhow::anyhow!("{} needs a value", name))
        };
        match key.as_str() {
            "--config" => out.config = Some(PathBuf::from(value("--config")?)),
            "--start-at" => out.start_at = Some(value("--start-at")?),
            "--target-url" => out.target_url = Some(value("--target-url")?),
            "--max-restarts" => {
                let raw = value("--max-restarts")?;
                out.max_restarts = Some(
                    raw.trim()
                        .parse()
                        .map_err(|_| anyhow::anyhow!("--max-restarts expects a number, got {:?}", raw))?,
                );
            }
            "--no-headless" => out.no_headless = true,
            other => warn!("ignoring unknown argument {:?}", other),
        }
    }
    Ok(out)
}

/// File config (explicit path, `OPENSLOT_CONFIG`, then the standard
/// locations), with command-line overrides on top. Defaults are used only
/// when the command line names the target itself.
fn resolve_config(cli: &CliArgs) -> anyhow::Result<EngineConfig> {
    let mut cfg = match config::load_engine_config(cli.config.as_deref())? {
        Some(cfg) => cfg,
        None if cli.target_url.is_some() => {
            info!("no config file found; using defaults");
            EngineConfig::default()
        }
        None => anyhow::bail!(
            "no {} found (set {} or pass --config / --target-url)",
            config::CONFIG_FILE_NAME,
            ENV_CONFIG_PATH
        ),
    };
    if let Some(url) = &cli.target_url {
        cfg.target_url = Some(url.clone());
    }
    if let Some(raw) = &cli.start_at {
        cfg.open_at = Some(config::parse_open_at(raw)?);
    }
    if let Some(n) = cli.max_restarts {
        cfg.backoff.max_restarts = n;
    }
    if cli.no_headless {
        cfg.browser.headless = false;
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = parse_args(std::env::args().skip(1))?;
    let cfg = resolve_config(&cli)?;
    info!(
        "target={} open_at={:?} headless={} max_restarts={}",
        cfg.target_url.as_deref().unwrap_or_default(),
        cfg.open_at,
        cfg.browser.headless,
        cfg.backoff.max_restarts
    );

    let state = AppState::new(cfg, AppState::build_http_client(HTTP_TIMEOUT)?);
    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping");
                state.abort();
            }
        });
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pacer = Pacer::new(clock.clone(), state.abort_receiver());
    let cfg = state.config.clone();
    let sink = FileArtifacts::create(&cfg.artifacts_dir, clock.now()).await?;
    info!("event log: {}", sink.event_log().display());

    let factory = ChromiumSessions::new(cfg.browser.clone());
    let mut runner = Runner::new(factory, &cfg, pacer, &sink).with_config_auth()?;

    match runner.run().await {
        Ok(outcome) => {
            info!(
                "finished: state={:?} path={:?} submitted={} verified={:?} reason={}",
                outcome.final_state,
                outcome.path,
                outcome.submitted,
                outcome.verified,
                outcome.reason.as_deref().unwrap_or("-")
            );
            if let Some(msg) = &outcome.result_message {
                info!("result message: {}", msg);
            }
            if !matches!(outcome.final_state, PollState::Submitted | PollState::Verified) {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(EngineError::Cancelled) => {
            warn!("cancelled by operator");
            std::process::exit(130);
        }
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_both_flag_forms() {
        let cli = parse_args(args(&[
            "--config",
            "a.json",
            "--start-at=2025-08-19T10:00:00",
            "--max-restarts",
            "4",
            "--no-headless",
        ]))
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("a.json")));
        assert_eq!(cli.start_at.as_deref(), Some("2025-08-19T10:00:00"));
        assert_eq!(cli.max_restarts, Some(4));
        assert!(cli.no_headless);
    }

    #[test]
    fn rejects_missing_and_malformed_values() {
        assert!(parse_args(args(&["--target-url"])).is_err());
        assert!(parse_args(args(&["--max-restarts", "many"])).is_err());
    }

    #[test]
    fn command_line_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openslot.json");
        std::fs::write(
            &path,
            r#"{"target_url": "https://example.test/a?sn=1", "backoff": {"max_restarts": 1}}"#,
        )
        .unwrap();
        let cli = CliArgs {
            config: Some(path),
            target_url: Some("https://example.test/b?sn=2".into()),
            start_at: Some("2025-08-19 10:00".into()),
            max_restarts: Some(5),
            no_headless: true,
        };
        let cfg = resolve_config(&cli).unwrap();
        assert_eq!(cfg.target_url.as_deref(), Some("https://example.test/b?sn=2"));
        assert_eq!(cfg.backoff.max_restarts, 5);
        assert!(!cfg.browser.headless);
        assert_eq!(
            cfg.open_at.map(|t| t.format("%H:%M:%S").to_string()).as_deref(),
            Some("10:00:00")
        );
    }
}
