//! Session-level driver: open a browser session, run the engine in it, and
//! start over from authentication when the session is lost.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::clock::Pacer;
use super::flow::Engine;
use super::schedule::ScheduleWindow;
use crate::browser::chromium::ChromiumDom;
use crate::browser::DomProvider;
use crate::core::config::{BrowserSettings, EngineConfig};
use crate::core::error::EngineError;
use crate::core::types::RunOutcome;
use crate::features::artifacts::{self, ArtifactSink};
use crate::features::auth::{Authenticator, FormLogin};
use crate::features::recovery::RestartBudget;

/// Produces fresh browser sessions. A restart always gets a new one; a lost
/// session is handed back to `close` and never reused.
#[async_trait]
pub trait SessionFactory: Send {
    type Session: DomProvider + 'static;

    async fn open(&mut self) -> Result<Self::Session, EngineError>;

    async fn close(&mut self, _session: Self::Session) {}
}

/// One fresh Chromium per session. A failed launch counts as a disconnect so
/// it draws from the same restart budget.
pub struct ChromiumSessions {
    settings: BrowserSettings,
}

impl ChromiumSessions {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessions {
    type Session = ChromiumDom;

    async fn open(&mut self) -> Result<ChromiumDom, EngineError> {
        ChromiumDom::launch(&self.settings)
            .await
            .map_err(|e| EngineError::Disconnect(format!("browser launch failed: {e:#}")))
    }

    async fn close(&mut self, session: ChromiumDom) {
        session.close().await;
    }
}

pub struct Runner<'a, F: SessionFactory> {
    factory: F,
    cfg: &'a EngineConfig,
    pacer: Pacer,
    sink: &'a dyn ArtifactSink,
    auth: Option<Box<dyn Authenticator>>,
}

impl<'a, F: SessionFactory> Runner<'a, F> {
    pub fn new(factory: F, cfg: &'a EngineConfig, pacer: Pacer, sink: &'a dyn ArtifactSink) -> Self {
        Self {
            factory,
            cfg,
            pacer,
            sink,
            auth: None,
        }
    }

    /// Form login when a login URL is configured.
    pub fn with_config_auth(mut self) -> Result<Self, EngineError> {
        if let Some(url) = self.cfg.login_url.as_deref() {
            self.auth = Some(Box::new(FormLogin::from_config(url, &self.cfg.credentials)?));
        }
        Ok(self)
    }

    pub fn with_auth(mut self, auth: Box<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    async fn event(&self, message: &str) {
        artifacts::record_event(self.sink, self.pacer.now(), message).await;
    }

    pub async fn run(&mut self) -> Result<RunOutcome, EngineError> {
        let window = ScheduleWindow::from_timing(self.pacer.now(), self.cfg.open_at, &self.cfg.timing);
        info!(
            "runner: target={:?} pre_window={} end={}",
            window.target, window.pre_window, window.end
        );
        let mut budget = RestartBudget::new(self.cfg.backoff.max_restarts);

        loop {
            self.pacer.check()?;
            let result = match self.factory.open().await {
                Ok(mut session) => {
                    let result = {
                        let mut engine = Engine::new(&mut session, self.cfg, &self.pacer, self.sink, window)
                            .with_auth(self.auth.as_deref());
                        engine.run().await
                    };
                    artifacts::dump_network_log(&mut session, self.sink, self.pacer.now()).await;
                    self.factory.close(session).await;
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    budget.reset();
                    info!(
                        "runner: finished in {:?} (submitted={}, verified={:?})",
                        outcome.final_state, outcome.submitted, outcome.verified
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_disconnect() => {
                    if !budget.try_restart() {
                        error!("runner: restart budget spent: {}", e);
                        return Err(EngineError::RestartsExhausted {
                            restarts: budget.used(),
                            last: e.to_string(),
                        });
                    }
                    warn!("runner: session lost ({}), restart {}/{}", e, budget.used(), budget.max());
                    self.event(&format!(
                        "session restart {}/{} after: {}",
                        budget.used(),
                        budget.max(),
                        e
                    ))
                    .await;
                    self.pacer.pause(self.cfg.backoff.restart_delay()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{DomOp, Document, MemoryDom};
    use crate::core::error::DomError;
    use crate::engine::clock::ManualClock;
    use crate::features::artifacts::MemoryArtifacts;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Arc;

    const TARGET: &str = "https://example.test/parent/Appchild_view.asp?sn=108";

    struct Scripted {
        sessions: VecDeque<MemoryDom>,
        opened: usize,
        closed: usize,
    }

    #[async_trait]
    impl SessionFactory for Scripted {
        type Session = MemoryDom;

        async fn open(&mut self) -> Result<MemoryDom, EngineError> {
            self.opened += 1;
            self.sessions
                .pop_front()
                .ok_or_else(|| EngineError::Disconnect("no browser".into()))
        }

        async fn close(&mut self, _session: MemoryDom) {
            self.closed += 1;
        }
    }

    fn dead() -> MemoryDom {
        let mut dom = MemoryDom::new().page(TARGET, Document::text("신청예정"));
        dom.fail_always(DomOp::Refresh, DomError::Disconnected("chrome not reachable".into()));
        dom
    }

    fn quiet() -> MemoryDom {
        MemoryDom::new().page(TARGET, Document::text("신청예정"))
    }

    fn setup() -> (EngineConfig, Pacer, MemoryArtifacts) {
        let mut cfg = EngineConfig::default();
        cfg.target_url = Some(TARGET.into());
        cfg.timing.no_target_horizon_secs = 20;
        let t0 = NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        (cfg, Pacer::unattended(Arc::new(ManualClock::new(t0))), MemoryArtifacts::new())
    }

    #[tokio::test]
    async fn restarts_after_disconnect_then_finishes() {
        let (cfg, pacer, sink) = setup();
        let factory = Scripted {
            sessions: VecDeque::from([dead(), quiet()]),
            opened: 0,
            closed: 0,
        };
        let mut runner = Runner::new(factory, &cfg, pacer, &sink);
        let out = runner.run().await.unwrap();
        assert_eq!(out.final_state, crate::core::types::PollState::TimedOut);
        assert_eq!(runner.factory().opened, 2);
        assert_eq!(runner.factory().closed, 2);
        assert!(sink.logged("session restart 1/2"));

        let logs: Vec<String> = sink
            .file_names()
            .into_iter()
            .filter(|n| n.starts_with("har_") && n.ends_with(".jsonl"))
            .collect();
        assert_eq!(logs.len(), 2, "{logs:?}");
        let first = sink.html(&logs[0]).unwrap();
        assert!(first.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
        assert!(first.contains("Network.responseReceived"));
        assert!(first.contains(TARGET));
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_the_last_error() {
        let (cfg, pacer, sink) = setup();
        let factory = Scripted {
            sessions: VecDeque::from([dead(), dead(), dead(), quiet()]),
            opened: 0,
            closed: 0,
        };
        let mut runner = Runner::new(factory, &cfg, pacer, &sink);
        match runner.run().await {
            Err(EngineError::RestartsExhausted { restarts, last }) => {
                assert_eq!(restarts, 2);
                assert!(last.contains("chrome not reachable"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runner.factory().opened, 3);
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let (mut cfg, pacer, sink) = setup();
        cfg.login_url = Some("https://example.test/member/login.asp".into());
        cfg.credentials.username = Some("parent01".into());
        cfg.credentials.password = Some("pw".into());
        let factory = Scripted {
            sessions: VecDeque::from([quiet(), quiet()]),
            opened: 0,
            closed: 0,
        };
        let mut runner = Runner::new(factory, &cfg, pacer, &sink).with_config_auth().unwrap();
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
        assert_eq!(runner.factory().opened, 1);
    }
}
