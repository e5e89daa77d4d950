//! Action invoker: click the chosen control and settle into whatever context
//! it produced (dialog, new window, embedded frame).
//!
//! Missing secondary contexts are normal. Only a disconnect escapes as an
//! error; everything else is reported through [`InvokeOutcome`].

use std::time::Duration;
use tracing::{debug, info, warn};

use super::detector;
use super::signals;
use crate::browser::{displayed, Control, DomProvider, Pattern, WindowHandle};
use crate::core::config::TimingConfig;
use crate::core::error::{tolerate, DomError, EngineError};
use crate::engine::clock::Pacer;

pub const CLICK_ATTEMPTS: u32 = 3;
pub const CLICK_RETRY_PAUSE: Duration = Duration::from_millis(200);
pub const WINDOW_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickResult {
    Clicked,
    /// The reference went stale; the caller has to find the control again.
    Stale,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeReport {
    pub dialog: Option<String>,
    pub switched_window: bool,
    pub entered_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    Proceeded(InvokeReport),
    /// The click was answered with throttling language.
    RateLimited(String),
    /// A challenge widget is on screen after the click.
    Challenge,
    ClickFailed(String),
}

pub struct Invoker<'a> {
    timing: &'a TimingConfig,
    pacer: &'a Pacer,
}

impl<'a> Invoker<'a> {
    pub fn new(timing: &'a TimingConfig, pacer: &'a Pacer) -> Self {
        Self { timing, pacer }
    }

    pub fn pacer(&self) -> &Pacer {
        self.pacer
    }

    /// Scroll and click, retrying intercepted clicks. An anchor that never
    /// takes the click is followed by URL instead.
    pub async fn safe_click<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
        control: &Control,
    ) -> Result<ClickResult, EngineError> {
        let mut last: Option<DomError> = None;
        for attempt in 1..=CLICK_ATTEMPTS {
            tolerate("scroll_into_view", dom.scroll_into_view(control).await)?;
            match dom.invoke(control).await {
                Ok(()) => return Ok(ClickResult::Clicked),
                Err(e) if e.is_disconnect() => return Err(e.into()),
                Err(DomError::Stale) => return Ok(ClickResult::Stale),
                Err(e) if e.is_transient_ui() => {
                    debug!("invoker: click attempt {} intercepted: {}", attempt, e);
                    last = Some(e);
                    self.pacer.pause(CLICK_RETRY_PAUSE).await?;
                }
                Err(e) => {
                    last = Some(e);
                    break;
                }
            }
        }

        if control.tag == "a" {
            if let Some(url) = self.href_target(dom, control).await? {
                info!("invoker: click never landed, following href {}", url);
                if tolerate("navigate", dom.navigate(&url).await)?.is_some() {
                    return Ok(ClickResult::Clicked);
                }
            }
        }
        let reason = last.map(|e| e.to_string()).unwrap_or_else(|| "click failed".into());
        warn!("invoker: {}", reason);
        Ok(ClickResult::Failed(reason))
    }

    async fn href_target<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
        control: &Control,
    ) -> Result<Option<String>, EngineError> {
        let href = tolerate("attribute", dom.attribute(control, "href").await)?.flatten();
        let Some(href) = href.map(|h| h.trim().to_string()) else {
            return Ok(None);
        };
        if href.is_empty() || href.starts_with('#') || href.to_lowercase().starts_with("javascript:") {
            return Ok(None);
        }
        let base = tolerate("current_url", dom.current_url().await)?.unwrap_or_default();
        let resolved = url::Url::parse(&base)
            .and_then(|b| b.join(&href))
            .map(|u| u.to_string())
            .unwrap_or(href);
        Ok(Some(resolved))
    }

    pub async fn accept_dialog<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
        timeout: Duration,
    ) -> Result<Option<String>, EngineError> {
        let msg = tolerate("accept_dialog", dom.accept_dialog(timeout).await)?.flatten();
        if let Some(m) = &msg {
            info!("invoker: dialog accepted: {}", m);
        }
        Ok(msg)
    }

    /// Poll for a window that was not in `before` and switch to the newest.
    pub async fn switch_to_new_window<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
        before: &[WindowHandle],
    ) -> Result<bool, EngineError> {
        let deadline = self.pacer.now()
            + chrono::Duration::from_std(self.timing.new_window_timeout())
                .unwrap_or(chrono::Duration::zero());
        loop {
            let Some(handles) = tolerate("list_windows", dom.list_windows().await)? else {
                return Ok(false);
            };
            if let Some(newest) = handles.iter().rev().find(|h| !before.contains(h)) {
                if tolerate("switch_window", dom.switch_window(newest).await)?.is_some() {
                    info!("invoker: switched to new window {}", newest.0);
                    return Ok(true);
                }
                return Ok(false);
            }
            if self.pacer.now() >= deadline {
                return Ok(false);
            }
            self.pacer.pause(WINDOW_POLL).await?;
        }
    }

    /// Enter the first displayed frame that holds a form. Stays in the default
    /// document when none does.
    pub async fn enter_form_frame<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
    ) -> Result<bool, EngineError> {
        let Some(mut frames) = tolerate("list_frames", dom.list_frames().await)? else {
            return Ok(false);
        };
        let count = frames.len();
        for idx in 0..count {
            if idx > 0 {
                // Leaving a frame invalidates the earlier list.
                frames = tolerate("list_frames", dom.list_frames().await)?.unwrap_or_default();
            }
            let Some(frame) = frames.get(idx) else {
                break;
            };
            if !tolerate("is_displayed", dom.is_displayed(frame).await)?.unwrap_or(false) {
                continue;
            }
            if tolerate("switch_frame", dom.switch_frame(frame).await)?.is_none() {
                continue;
            }
            let forms = tolerate("query forms", dom.query(&Pattern::tags(&["form"])).await)?
                .unwrap_or_default();
            if !forms.is_empty() {
                info!("invoker: entered frame #{} holding {} form(s)", idx, forms.len());
                return Ok(true);
            }
            tolerate("switch_default_frame", dom.switch_default_frame().await)?;
        }
        Ok(false)
    }

    /// Dialog plus frame handling after a navigation the engine made itself.
    pub async fn settle_after_navigation<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
        dialog_timeout: Duration,
    ) -> Result<InvokeReport, EngineError> {
        let dialog = self.accept_dialog(dom, dialog_timeout).await?;
        let entered_frame = self.enter_form_frame(dom).await?;
        Ok(InvokeReport {
            dialog,
            switched_window: false,
            entered_frame,
        })
    }

    /// Click the detected apply control and settle. A stale reference is
    /// re-detected and retried within the click budget.
    pub async fn invoke_action<D: DomProvider + ?Sized>(
        &self,
        dom: &mut D,
        control: Control,
    ) -> Result<InvokeOutcome, EngineError> {
        let before = tolerate("list_windows", dom.list_windows().await)?.unwrap_or_default();
        let mut control = control;
        let mut clicked = false;
        for _ in 0..CLICK_ATTEMPTS {
            match self.safe_click(dom, &control).await? {
                ClickResult::Clicked => {
                    clicked = true;
                    break;
                }
                ClickResult::Failed(reason) => return Ok(InvokeOutcome::ClickFailed(reason)),
                ClickResult::Stale => {
                    debug!("invoker: action went stale, re-detecting");
                    self.pacer.pause(CLICK_RETRY_PAUSE).await?;
                    match detector::find_apply_control(dom).await? {
                        Some((_, fresh)) => control = fresh,
                        None => {
                            return Ok(InvokeOutcome::ClickFailed(
                                "action control vanished".into(),
                            ))
                        }
                    }
                }
            }
        }
        if !clicked {
            return Ok(InvokeOutcome::ClickFailed("action control kept going stale".into()));
        }

        let dialog = self
            .accept_dialog(dom, self.timing.click_dialog_timeout())
            .await?;
        if let Some(m) = &dialog {
            if signals::is_rate_limited(m) {
                return Ok(InvokeOutcome::RateLimited(m.clone()));
            }
        }
        let switched_window = if before.is_empty() {
            false
        } else {
            self.switch_to_new_window(dom, &before).await?
        };
        let entered_frame = self.enter_form_frame(dom).await?;
        if detector::detect_challenge(dom).await? {
            warn!("invoker: challenge present after click, abandoning click path");
            return Ok(InvokeOutcome::Challenge);
        }
        Ok(InvokeOutcome::Proceeded(InvokeReport {
            dialog,
            switched_window,
            entered_frame,
        }))
    }
}

/// Displayed forms in the current context, document order.
pub async fn visible_forms<D: DomProvider + ?Sized>(dom: &mut D) -> Result<Vec<Control>, EngineError> {
    Ok(tolerate(
        "query forms",
        displayed(dom, None, &Pattern::tags(&["form"])).await,
    )?
    .unwrap_or_default())
}
