//! [`DomProvider`] over a real browser via `chromiumoxide`.
//!
//! One browser, one active page. Element references are kept in the page's
//! own JS registry (see [`super::scripts`]), so they die with the document.
//! JavaScript dialogs are accepted by a listener task as soon as they open;
//! their text is queued for [`DomProvider::accept_dialog`]. `Network.*`
//! events are buffered the same way for [`DomProvider::network_log`].

use anyhow::anyhow;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventLoadingFailed, EventRequestWillBeSent,
    EventResponseReceived,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::browser_manager::launch_browser;
use super::scripts;
use super::{Control, DomProvider, NetworkEvent, Pattern, ScannedField, WindowHandle};
use crate::core::config::BrowserSettings;
use crate::core::error::{DomError, DomResult};
use crate::core::types::{FieldDescriptor, FieldState, InputKind, SelectOption, TagKind};

const DIALOG_POLL: Duration = Duration::from_millis(100);
/// Oldest events are dropped past this many.
const NETWORK_LOG_CAP: usize = 20_000;

type NetworkLog = Arc<Mutex<VecDeque<NetworkEvent>>>;

async fn push_network(log: &NetworkLog, event: NetworkEvent) {
    let mut q = log.lock().await;
    if q.len() >= NETWORK_LOG_CAP {
        q.pop_front();
    }
    q.push_back(event);
}

#[derive(Debug, Deserialize)]
struct RawControl {
    id: u64,
    tag: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawField {
    control: RawControl,
    tag: String,
    input_type: String,
    name: String,
    id: String,
    placeholder: String,
    label: String,
    required: bool,
    value: String,
    checked: bool,
    readonly: bool,
    disabled: bool,
    #[serde(default)]
    options: Vec<SelectOption>,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    x: f64,
    y: f64,
}

fn cdp_err(e: impl std::fmt::Display) -> DomError {
    DomError::classify(e.to_string())
}

pub struct ChromiumDom {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
    generation: u64,
    frame_path: Vec<u64>,
    /// Target ids in first-seen order.
    window_order: Vec<String>,
    dialog_watched: HashSet<String>,
    dialogs: Arc<Mutex<VecDeque<String>>>,
    network: NetworkLog,
    listener_tasks: Vec<JoinHandle<()>>,
}

impl ChromiumDom {
    /// Launch a browser and open a blank page.
    pub async fn launch(settings: &BrowserSettings) -> anyhow::Result<Self> {
        let launched = launch_browser(settings).await?;
        let page = launched
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("failed to open page: {}", e))?;

        let mut dom = Self {
            browser: launched.browser,
            handler_task: launched.handler_task,
            page,
            generation: 0,
            frame_path: Vec::new(),
            window_order: Vec::new(),
            dialog_watched: HashSet::new(),
            dialogs: Arc::new(Mutex::new(VecDeque::new())),
            network: Arc::new(Mutex::new(VecDeque::new())),
            listener_tasks: Vec::new(),
        };
        let first = dom.page.clone();
        dom.watch_page(&first).await;
        Ok(dom)
    }

    /// Close the browser. Dropping without closing leaves the process to the
    /// handler task's teardown.
    pub async fn close(mut self) {
        for t in self.listener_tasks.drain(..) {
            t.abort();
        }
        if let Err(e) = self.browser.close().await {
            warn!("browser close error (non-fatal): {}", e);
        }
        self.handler_task.abort();
        info!("browser closed");
    }

    fn target_key(page: &Page) -> String {
        page.target_id().inner().clone()
    }

    /// Start auto-accepting dialogs on `page` and remember its open order.
    async fn watch_page(&mut self, page: &Page) {
        let key = Self::target_key(page);
        if !self.window_order.contains(&key) {
            self.window_order.push(key.clone());
        }
        if !self.dialog_watched.insert(key.clone()) {
            return;
        }
        self.watch_network(page).await;
        let mut events = match page.event_listener::<EventJavascriptDialogOpening>().await {
            Ok(s) => s,
            Err(e) => {
                warn!("dialog listener unavailable on {}: {}", key, e);
                return;
            }
        };
        let page = page.clone();
        let queue = self.dialogs.clone();
        self.listener_tasks.push(tokio::spawn(async move {
            while let Some(ev) = events.next().await {
                debug!("dialog opened: {:?} {}", ev.r#type, ev.message);
                queue.lock().await.push_back(ev.message.clone());
                if let Err(e) = page.execute(HandleJavaScriptDialogParams::new(true)).await {
                    warn!("dialog accept failed: {}", e);
                }
            }
        }));
    }

    /// Buffer request, response and failure events of `page`.
    async fn watch_network(&mut self, page: &Page) {
        if let Err(e) = page.execute(NetworkEnableParams::default()).await {
            warn!("network domain unavailable: {}", e);
            return;
        }

        match page.event_listener::<EventRequestWillBeSent>().await {
            Ok(mut events) => {
                let log = self.network.clone();
                self.listener_tasks.push(tokio::spawn(async move {
                    while let Some(ev) = events.next().await {
                        let event = NetworkEvent {
                            method: "Network.requestWillBeSent".into(),
                            request_id: ev.request_id.inner().clone(),
                            url: ev.request.url.clone(),
                            http_method: Some(ev.request.method.clone()),
                            status: None,
                            mime_type: None,
                            error: None,
                            timestamp: *ev.timestamp.inner(),
                        };
                        push_network(&log, event).await;
                    }
                }));
            }
            Err(e) => warn!("request listener unavailable: {}", e),
        }

        match page.event_listener::<EventResponseReceived>().await {
            Ok(mut events) => {
                let log = self.network.clone();
                self.listener_tasks.push(tokio::spawn(async move {
                    while let Some(ev) = events.next().await {
                        let event = NetworkEvent {
                            method: "Network.responseReceived".into(),
                            request_id: ev.request_id.inner().clone(),
                            url: ev.response.url.clone(),
                            http_method: None,
                            status: Some(ev.response.status),
                            mime_type: Some(ev.response.mime_type.clone()),
                            error: None,
                            timestamp: *ev.timestamp.inner(),
                        };
                        push_network(&log, event).await;
                    }
                }));
            }
            Err(e) => warn!("response listener unavailable: {}", e),
        }

        match page.event_listener::<EventLoadingFailed>().await {
            Ok(mut events) => {
                let log = self.network.clone();
                self.listener_tasks.push(tokio::spawn(async move {
                    while let Some(ev) = events.next().await {
                        let event = NetworkEvent {
                            method: "Network.loadingFailed".into(),
                            request_id: ev.request_id.inner().clone(),
                            url: String::new(),
                            http_method: None,
                            status: None,
                            mime_type: None,
                            error: Some(ev.error_text.clone()),
                            timestamp: *ev.timestamp.inner(),
                        };
                        push_network(&log, event).await;
                    }
                }));
            }
            Err(e) => warn!("loading-failed listener unavailable: {}", e),
        }
    }

    fn check(&self, control: &Control) -> DomResult<()> {
        if control.generation() != self.generation {
            return Err(DomError::Stale);
        }
        Ok(())
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    async fn eval<T: DeserializeOwned>(&self, op: &str, args: &[Value]) -> DomResult<T> {
        let js = scripts::call(op, args);
        let res = self.page.evaluate(js).await.map_err(cdp_err)?;
        res.into_value::<T>()
            .map_err(|e| DomError::Script(format!("{op}: unexpected result: {e}")))
    }

    async fn eval_value(&self, op: &str, args: &[Value]) -> DomResult<Value> {
        let js = scripts::call(op, args);
        let res = self.page.evaluate(js).await.map_err(cdp_err)?;
        Ok(res.into_value::<Value>().unwrap_or(Value::Null))
    }

    fn control(&self, raw: RawControl) -> Control {
        Control::new(raw.id, self.generation, raw.tag, raw.text)
    }

    fn path(&self) -> Value {
        json!(self.frame_path)
    }
}

#[async_trait]
impl DomProvider for ChromiumDom {
    async fn visible_text(&mut self, region: Option<&Control>) -> DomResult<String> {
        let id = match region {
            Some(c) => {
                self.check(c)?;
                json!(c.id())
            }
            None => Value::Null,
        };
        let v = self.eval_value("visibleText", &[self.path(), id]).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn query(&mut self, pattern: &Pattern) -> DomResult<Vec<Control>> {
        let p = serde_json::to_value(pattern).map_err(|e| DomError::Script(e.to_string()))?;
        let raw: Vec<RawControl> = self.eval("query", &[self.path(), Value::Null, p]).await?;
        Ok(raw.into_iter().map(|r| self.control(r)).collect())
    }

    async fn query_within(&mut self, scope: &Control, pattern: &Pattern) -> DomResult<Vec<Control>> {
        self.check(scope)?;
        let p = serde_json::to_value(pattern).map_err(|e| DomError::Script(e.to_string()))?;
        let raw: Vec<RawControl> = self
            .eval("query", &[self.path(), json!(scope.id()), p])
            .await?;
        Ok(raw.into_iter().map(|r| self.control(r)).collect())
    }

    async fn is_displayed(&mut self, control: &Control) -> DomResult<bool> {
        self.check(control)?;
        self.eval("displayed", &[json!(control.id())]).await
    }

    async fn parent(&mut self, control: &Control) -> DomResult<Option<Control>> {
        self.check(control)?;
        let raw: Option<RawControl> = self.eval("parent", &[json!(control.id())]).await?;
        Ok(raw.map(|r| self.control(r)))
    }

    async fn attribute(&mut self, control: &Control, name: &str) -> DomResult<Option<String>> {
        self.check(control)?;
        self.eval("attr", &[json!(control.id()), json!(name)]).await
    }

    async fn scroll_into_view(&mut self, control: &Control) -> DomResult<()> {
        self.check(control)?;
        self.eval_value("scroll", &[json!(control.id())]).await?;
        Ok(())
    }

    async fn invoke(&mut self, control: &Control) -> DomResult<()> {
        self.check(control)?;
        let pt: RawPoint = self.eval("clickPoint", &[json!(control.id())]).await?;
        self.page
            .click(Point::new(pt.x, pt.y))
            .await
            .map_err(cdp_err)?;
        Ok(())
    }

    async fn set_value(&mut self, control: &Control, value: &str) -> DomResult<()> {
        self.check(control)?;
        self.eval_value("setValue", &[json!(control.id()), json!(value)])
            .await?;
        Ok(())
    }

    async fn select_option(&mut self, control: &Control, value: &str) -> DomResult<()> {
        self.check(control)?;
        self.eval_value("selectOption", &[json!(control.id()), json!(value)])
            .await?;
        Ok(())
    }

    async fn submit_form(&mut self, form: &Control) -> DomResult<()> {
        self.check(form)?;
        self.eval_value("submit", &[json!(form.id())]).await?;
        Ok(())
    }

    async fn form_fields(&mut self, form: &Control) -> DomResult<Vec<ScannedField>> {
        self.check(form)?;
        let raw: Vec<RawField> = self.eval("fields", &[json!(form.id())]).await?;
        let mut out = Vec::with_capacity(raw.len());
        for f in raw {
            let Some(tag) = TagKind::parse(&f.tag) else {
                continue;
            };
            let control = self.control(f.control);
            out.push(ScannedField {
                control,
                descriptor: FieldDescriptor {
                    tag,
                    input_kind: InputKind::parse(&f.input_type),
                    name: f.name,
                    id: f.id,
                    placeholder: f.placeholder,
                    label: f.label,
                    required: f.required,
                },
                state: FieldState {
                    value: f.value,
                    checked: f.checked,
                    readonly: f.readonly,
                    disabled: f.disabled,
                    options: f.options,
                },
            });
        }
        Ok(out)
    }

    async fn navigate(&mut self, url: &str) -> DomResult<()> {
        self.bump();
        self.frame_path.clear();
        self.page.goto(url).await.map_err(cdp_err)?;
        Ok(())
    }

    async fn refresh(&mut self) -> DomResult<()> {
        self.bump();
        self.frame_path.clear();
        self.page.reload().await.map_err(cdp_err)?;
        Ok(())
    }

    async fn current_url(&mut self) -> DomResult<String> {
        let url = self.page.url().await.map_err(cdp_err)?;
        Ok(url.unwrap_or_default())
    }

    async fn page_source(&mut self) -> DomResult<String> {
        let v = self.eval_value("source", &[self.path()]).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&mut self) -> DomResult<Vec<u8>> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(cdp_err)
    }

    async fn list_frames(&mut self) -> DomResult<Vec<Control>> {
        let raw: Vec<RawControl> = self.eval("frames", &[self.path()]).await?;
        Ok(raw.into_iter().map(|r| self.control(r)).collect())
    }

    async fn switch_frame(&mut self, frame: &Control) -> DomResult<()> {
        self.check(frame)?;
        self.eval_value("enterFrame", &[json!(frame.id())]).await?;
        self.frame_path.push(frame.id());
        self.bump();
        Ok(())
    }

    async fn switch_default_frame(&mut self) -> DomResult<()> {
        if !self.frame_path.is_empty() {
            self.frame_path.clear();
            self.bump();
        }
        Ok(())
    }

    async fn list_windows(&mut self) -> DomResult<Vec<WindowHandle>> {
        let pages = self.browser.pages().await.map_err(cdp_err)?;
        for p in &pages {
            self.watch_page(p).await;
        }
        let live: HashSet<String> = pages.iter().map(Self::target_key).collect();
        self.window_order.retain(|k| live.contains(k));
        Ok(self
            .window_order
            .iter()
            .map(|k| WindowHandle(k.clone()))
            .collect())
    }

    async fn switch_window(&mut self, handle: &WindowHandle) -> DomResult<()> {
        let pages = self.browser.pages().await.map_err(cdp_err)?;
        let page = pages
            .into_iter()
            .find(|p| Self::target_key(p) == handle.0)
            .ok_or_else(|| DomError::Script(format!("no such window: {}", handle.0)))?;
        page.bring_to_front().await.map_err(cdp_err)?;
        self.watch_page(&page).await;
        self.page = page;
        self.frame_path.clear();
        self.bump();
        Ok(())
    }

    async fn accept_dialog(&mut self, timeout: Duration) -> DomResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.dialogs.lock().await.pop_front() {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(DIALOG_POLL).await;
        }
    }

    async fn exec_inert(&mut self, script: &str) -> DomResult<()> {
        self.page.evaluate(script).await.map_err(cdp_err)?;
        Ok(())
    }

    async fn cookie_header(&mut self) -> DomResult<String> {
        let cookies = self.page.get_cookies().await.map_err(cdp_err)?;
        Ok(cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "))
    }

    async fn network_log(&mut self) -> DomResult<Vec<NetworkEvent>> {
        Ok(self.network.lock().await.drain(..).collect())
    }
}
