//! The acquisition state machine for one browser session.
//!
//! ```text
//! INIT ─▶ WAITING_COARSE ─▶ WAITING_FINE ─┬─▶ ACTION_FOUND ─▶ FORM_DETECTED ─▶ SUBMITTED ─▶ VERIFIED
//!                                         └─▶ TIMED_OUT
//! ```
//!
//! A disconnect anywhere moves the session to FAILED and escapes as
//! `EngineError::Disconnect`; the runner decides whether to restart.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::cadence::{coarse_sleep, fmt_remaining, sample_fine_interval};
use super::clock::Pacer;
use super::schedule::{until, ScheduleWindow};
use crate::browser::scripts::{LIVENESS_PROBE, SAME_TAB_POLICY};
use crate::browser::DomProvider;
use crate::core::config::EngineConfig;
use crate::core::error::{tolerate, DomError, EngineError};
use crate::core::types::{AcquisitionPath, PollState, RunOutcome};
use crate::features::artifacts::{self, ArtifactSink};
use crate::features::auth::Authenticator;
use crate::features::detector;
use crate::features::direct_apply;
use crate::features::field_mapper;
use crate::features::invoker::{visible_forms, InvokeOutcome, Invoker};
use crate::features::recovery::BackoffState;
use crate::features::signals::{self, Signal};
use crate::features::submitter::{self, Submission};
use crate::features::verifier::{self, VerifyTarget};

pub const FORM_RESCAN_PAUSE: Duration = Duration::from_millis(500);
pub const CHALLENGE_SNAPSHOT: &str = "captcha_page";
pub const RESULT_PAGE: &str = "submission_result.html";

/// How the fine phase ended.
#[derive(Debug)]
enum FineExit {
    /// The apply control was clicked and the page settled.
    Invoked,
    /// A direct apply URL exposed the form.
    Direct(String),
    TimedOut,
}

pub struct Engine<'a> {
    dom: &'a mut dyn DomProvider,
    cfg: &'a EngineConfig,
    pacer: &'a Pacer,
    sink: &'a dyn ArtifactSink,
    auth: Option<&'a dyn Authenticator>,
    window: ScheduleWindow,
    state: PollState,
    backoff: BackoffState,
}

impl<'a> Engine<'a> {
    pub fn new(
        dom: &'a mut dyn DomProvider,
        cfg: &'a EngineConfig,
        pacer: &'a Pacer,
        sink: &'a dyn ArtifactSink,
        window: ScheduleWindow,
    ) -> Self {
        Self {
            dom,
            cfg,
            pacer,
            sink,
            auth: None,
            window,
            state: PollState::Init,
            backoff: BackoffState::from_config(&cfg.backoff),
        }
    }

    pub fn with_auth(mut self, auth: Option<&'a dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    async fn event(&self, message: &str) {
        artifacts::record_event(self.sink, self.pacer.now(), message).await;
    }

    async fn set_state(&mut self, next: PollState) {
        if self.state == next {
            return;
        }
        self.state = next;
        info!("poll_state={:?}", next);
        self.event(&format!("state -> {:?}", next)).await;
    }

    fn target(&self) -> Result<&'a str, EngineError> {
        let cfg: &'a EngineConfig = self.cfg;
        cfg.target_url
            .as_deref()
            .ok_or_else(|| EngineError::Config("target_url is required".into()))
    }

    /// Drive the session to a terminal outcome.
    pub async fn run(&mut self) -> Result<RunOutcome, EngineError> {
        match self.run_inner().await {
            Err(e) if e.is_disconnect() => {
                self.set_state(PollState::Failed).await;
                self.event(&format!("session lost: {e}")).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn run_inner(&mut self) -> Result<RunOutcome, EngineError> {
        info!("poll_state={:?}", self.state);
        let target = self.target()?;
        let cfg = self.cfg;
        let pacer = self.pacer;
        let inv = Invoker::new(&cfg.timing, pacer);

        if let Some(auth) = self.auth {
            auth.login(&mut *self.dom, &inv).await?;
            self.event("logged in").await;
        }
        tolerate("navigate", self.dom.navigate(target).await)?;
        self.apply_same_tab().await?;

        if self.window.needs_coarse_wait(pacer.now()) {
            self.set_state(PollState::WaitingCoarse).await;
            self.coarse_wait().await?;
        }
        self.set_state(PollState::WaitingFine).await;

        let exit = self.fine_poll(&inv, target).await?;
        let path = match exit {
            FineExit::TimedOut => {
                self.set_state(PollState::TimedOut).await;
                let reason = "apply control did not appear in time";
                self.event(reason).await;
                return Ok(RunOutcome::terminal(PollState::TimedOut, reason));
            }
            FineExit::Invoked => AcquisitionPath::Control,
            FineExit::Direct(url) => {
                self.event(&format!("direct apply exposed a form at {url}")).await;
                AcquisitionPath::DirectUrl
            }
        };
        self.followup(&inv, target, path).await
    }

    async fn apply_same_tab(&mut self) -> Result<(), EngineError> {
        tolerate("same-tab policy", self.dom.exec_inert(SAME_TAB_POLICY).await)?;
        Ok(())
    }

    /// Cheap script round trip. Only a disconnect counts as a failure.
    async fn liveness(&mut self) -> Result<(), EngineError> {
        match self.dom.exec_inert(LIVENESS_PROBE).await {
            Err(DomError::Disconnected(msg)) => Err(EngineError::Disconnect(msg)),
            Err(e) => {
                debug!("flow: liveness probe fault tolerated: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    // ── WAITING_COARSE ────────────────────────────────────────────────────

    async fn coarse_wait(&mut self) -> Result<(), EngineError> {
        let every = chrono::Duration::from_std(self.cfg.timing.coarse_refresh())
            .unwrap_or(chrono::Duration::zero());
        let mut next_refresh = self.pacer.now() + every;
        info!(
            "flow: coarse wait, {} until the fine phase",
            fmt_remaining(self.window.until_pre_window(self.pacer.now()))
        );
        loop {
            let now = self.pacer.now();
            if !self.window.needs_coarse_wait(now) {
                return Ok(());
            }
            if now >= next_refresh {
                tolerate("refresh", self.dom.refresh().await)?;
                self.apply_same_tab().await?;
                self.liveness().await?;
                next_refresh = now + every;
                self.event(&format!(
                    "keep-warm refresh, {} until the fine phase",
                    fmt_remaining(self.window.until_pre_window(now))
                ))
                .await;
            }
            let remaining = self.window.until_pre_window(now);
            let sleep = coarse_sleep(remaining, until(now, next_refresh));
            self.pacer.pause(sleep).await?;
        }
    }

    // ── WAITING_FINE ──────────────────────────────────────────────────────

    /// Backoff sleeps never carry the run past the window end.
    fn within_window(&self, wait: Duration) -> Duration {
        wait.min(self.window.until_end(self.pacer.now()))
    }

    async fn challenge_pause(&mut self) -> Result<(), EngineError> {
        self.event("challenge present, capturing and backing off").await;
        artifacts::snapshot(&mut *self.dom, self.sink, CHALLENGE_SNAPSHOT).await?;
        let wait = self.within_window(self.cfg.backoff.challenge());
        self.pacer.pause(wait).await
    }

    async fn rate_limit_pause(&mut self, what: &str) -> Result<(), EngineError> {
        let backoff = self.backoff.on_rate_limited();
        let wait = self.within_window(backoff);
        self.event(&format!(
            "rate limited ({what}), backing off {}s",
            wait.as_secs()
        ))
        .await;
        self.pacer.pause(wait).await
    }

    async fn fine_poll(&mut self, inv: &Invoker<'_>, target: &str) -> Result<FineExit, EngineError> {
        let cfg = self.cfg;
        let pacer = self.pacer;
        loop {
            pacer.check()?;
            if self.window.expired(pacer.now()) {
                return Ok(FineExit::TimedOut);
            }

            tolerate("refresh", self.dom.refresh().await)?;
            self.apply_same_tab().await?;
            self.liveness().await?;

            let scan = detector::scan(&mut *self.dom).await?;
            match scan.signal {
                Signal::ChallengePresent => {
                    self.challenge_pause().await?;
                    continue;
                }
                Signal::RateLimited => {
                    self.rate_limit_pause("page").await?;
                    continue;
                }
                Signal::Available => {
                    if let Some(control) = scan.control {
                        self.event(&format!(
                            "apply control available: {:?} ({:?})",
                            control.text, scan.tier
                        ))
                        .await;
                        match inv.invoke_action(&mut *self.dom, control).await? {
                            InvokeOutcome::Proceeded(report) => {
                                self.backoff.on_clean_tick();
                                self.set_state(PollState::ActionFound).await;
                                if let Some(d) = report.dialog {
                                    self.event(&format!("dialog: {d}")).await;
                                }
                                return Ok(FineExit::Invoked);
                            }
                            InvokeOutcome::RateLimited(msg) => {
                                self.event(&format!("dialog: {msg}")).await;
                                self.rate_limit_pause("dialog").await?;
                                continue;
                            }
                            InvokeOutcome::Challenge => {
                                self.challenge_pause().await?;
                                continue;
                            }
                            InvokeOutcome::ClickFailed(reason) => {
                                warn!("flow: apply control could not be clicked: {}", reason);
                            }
                        }
                    }
                }
                Signal::NotAvailable => {}
            }

            if self.window.target_reached(pacer.now()) {
                let urls = direct_apply::candidate_urls(target, &cfg.direct_apply);
                let hit = direct_apply::probe_direct_urls(
                    &mut *self.dom,
                    inv,
                    &urls,
                    cfg.timing.probe_dialog_timeout(),
                )
                .await?;
                if let Some(url) = hit {
                    self.backoff.on_clean_tick();
                    return Ok(FineExit::Direct(url));
                }
                tolerate("navigate", self.dom.navigate(target).await)?;
            }

            self.backoff.on_clean_tick();
            let now = pacer.now();
            let interval = sample_fine_interval(cfg.timing.fine_cadence(), cfg.timing.fine_jitter())
                .min(self.window.until_end(now));
            debug!("flow: next tick in {}ms", interval.as_millis());
            pacer.pause(interval).await?;
        }
    }

    // ── ACTION_FOUND → FORM_DETECTED → SUBMITTED ──────────────────────────

    /// Wait for a form in the current context, checking frames between
    /// attempts. Returns whether one showed up.
    async fn await_form(&mut self, inv: &Invoker<'_>) -> Result<bool, EngineError> {
        let attempts = self.cfg.timing.followup_attempts.max(1);
        for attempt in 1..=attempts {
            if !visible_forms(&mut *self.dom).await?.is_empty() {
                return Ok(true);
            }
            if inv.enter_form_frame(&mut *self.dom).await? {
                return Ok(true);
            }
            debug!("flow: no form yet (attempt {}/{})", attempt, attempts);
            if attempt < attempts {
                self.pacer.pause(FORM_RESCAN_PAUSE).await?;
            }
        }
        Ok(false)
    }

    /// Fill the first visible form (when there is one) and submit. A
    /// throttled submission backs off and tries again in the same state
    /// until the window closes.
    async fn fill_and_submit(&mut self, inv: &Invoker<'_>) -> Result<Option<Submission>, EngineError> {
        let cfg = self.cfg;
        let mut last: Option<Submission> = None;
        loop {
            if self.await_form(inv).await? {
                self.set_state(PollState::FormDetected).await;
                if let Some(form) = visible_forms(&mut *self.dom).await?.into_iter().next() {
                    let report = field_mapper::fill_form(&mut *self.dom, &form, &cfg.profile).await?;
                    self.event(&format!(
                        "form filled: {} field(s), {} write(s), {} gap(s)",
                        report.fields,
                        report.writes,
                        report.gaps.len()
                    ))
                    .await;
                }
            }
            let Some(sub) = submitter::submit_current_form(
                &mut *self.dom,
                inv,
                cfg.timing.submit_dialog_timeout(),
            )
            .await?
            else {
                return Ok(last);
            };
            if let Some(d) = &sub.dialog {
                self.event(&format!("submit dialog: {d}")).await;
            }
            let throttled = sub
                .dialog
                .as_deref()
                .map(signals::is_rate_limited)
                .unwrap_or(false);
            last = Some(sub);
            if !throttled || self.window.expired(self.pacer.now()) {
                return Ok(last);
            }
            self.rate_limit_pause("submit").await?;
        }
    }

    async fn followup(
        &mut self,
        inv: &Invoker<'_>,
        target: &str,
        path: AcquisitionPath,
    ) -> Result<RunOutcome, EngineError> {
        let cfg = self.cfg;
        let mut path = path;
        let mut submission = self.fill_and_submit(inv).await?;

        if submission.is_none() && path == AcquisitionPath::Control {
            info!("flow: nothing to submit after the click, trying direct apply URLs");
            let urls = direct_apply::candidate_urls(target, &cfg.direct_apply);
            let hit = direct_apply::probe_direct_urls(
                &mut *self.dom,
                inv,
                &urls,
                cfg.timing.probe_dialog_timeout(),
            )
            .await?;
            if let Some(url) = hit {
                self.event(&format!("direct apply exposed a form at {url}")).await;
                path = AcquisitionPath::DirectUrl;
                submission = self.fill_and_submit(inv).await?;
            }
        }

        let Some(sub) = submission else {
            self.set_state(PollState::Failed).await;
            let reason = "no form or submit control after the action";
            self.event(reason).await;
            let mut out = RunOutcome::terminal(PollState::Failed, reason);
            out.path = Some(path);
            return Ok(out);
        };

        self.set_state(PollState::Submitted).await;
        self.event(&format!("submitted via {:?}", sub.method)).await;
        if let Some(html) = tolerate("page_source", self.dom.page_source().await)? {
            if let Err(e) = self.sink.save_html(RESULT_PAGE, &html).await {
                warn!("flow: saving {} failed: {}", RESULT_PAGE, e);
            }
        }

        let mut outcome = RunOutcome {
            final_state: PollState::Submitted,
            reason: None,
            path: Some(path),
            submitted: true,
            verified: None,
            result_message: sub.dialog.clone(),
        };

        let Some(status_url) = cfg.status_url.as_deref() else {
            outcome.reason = Some("submitted; no status page configured".into());
            return Ok(outcome);
        };
        let item = direct_apply::item_id(target, &cfg.direct_apply.id_params);
        let vt = VerifyTarget {
            item: item.as_ref().map(|(p, v)| (p.as_str(), v.as_str())),
            profile: Some(&cfg.profile),
        };
        let summary = verifier::verify(&mut *self.dom, self.sink, status_url, &vt, self.pacer.now()).await?;
        outcome.verified = Some(summary.found);
        if summary.found {
            self.set_state(PollState::Verified).await;
            outcome.final_state = PollState::Verified;
        } else {
            outcome.reason = Some("submitted; no evidence on the status page yet".into());
        }
        Ok(outcome)
    }
}
