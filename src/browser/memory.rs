//! In-memory [`DomProvider`].
//!
//! Pages are element trees built with [`Element`]. Each URL maps to a queue of
//! documents: every load takes the next one, and the last stays current, so a
//! test can script "closed, closed, open" across refreshes. Invoking an element
//! runs its [`Effect`]s. Every provider call is recorded in an event log, and
//! faults can be injected per operation.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::scripts;
use super::{Control, DomProvider, NetworkEvent, Pattern, ScannedField, WindowHandle};
use crate::core::error::{DomError, DomResult};
use crate::core::types::{FieldDescriptor, FieldState, InputKind, SelectOption, TagKind};
use crate::engine::clock::Clock;

// ───────────────────────────────────────────────────────────────────────────
// Page model
// ───────────────────────────────────────────────────────────────────────────

/// What happens when an element is invoked (or a form submitted).
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A JavaScript dialog opens with this text.
    Dialog(String),
    /// The current window loads this URL.
    Navigate(String),
    /// A new window opens on this URL. Stays in the current window when the
    /// same-tab policy is active.
    OpenWindow(String),
    /// The invocation itself fails.
    Fail(DomError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    tag: String,
    attrs: BTreeMap<String, String>,
    text: String,
    hidden: bool,
    children: Vec<Element>,
    effects: Vec<Effect>,
    frame: Option<Box<Document>>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn id(self, id: &str) -> Self {
        self.attr("id", id)
    }

    pub fn class(self, class: &str) -> Self {
        self.attr("class", class)
    }

    pub fn name(self, name: &str) -> Self {
        self.attr("name", name)
    }

    pub fn value(self, value: &str) -> Self {
        self.attr("value", value)
    }

    pub fn required(self) -> Self {
        self.attr("required", "")
    }

    pub fn checked(self) -> Self {
        self.attr("checked", "checked")
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn on_invoke(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Embedded document for `iframe`/`frame` elements.
    pub fn frame(mut self, doc: Document) -> Self {
        self.frame = Some(Box::new(doc));
        self
    }
}

pub fn link(text: &str, href: &str) -> Element {
    Element::new("a").attr("href", href).text(text)
}

pub fn button(text: &str) -> Element {
    Element::new("button").text(text)
}

pub fn input(input_type: &str, name: &str) -> Element {
    Element::new("input").attr("type", input_type).name(name)
}

pub fn label(for_id: &str, text: &str) -> Element {
    Element::new("label").attr("for", for_id).text(text)
}

pub fn select(name: &str, options: &[(&str, &str)]) -> Element {
    Element::new("select").name(name).children(
        options
            .iter()
            .map(|(v, t)| Element::new("option").value(v).text(t)),
    )
}

/// A page: the children of its `body`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    body: Vec<Element>,
}

impl Document {
    pub fn new(body: impl IntoIterator<Item = Element>) -> Self {
        Self {
            body: body.into_iter().collect(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new([Element::new("p").text(text)])
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Live state
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attrs: BTreeMap<String, String>,
    text: String,
    hidden: bool,
    parent: Option<usize>,
    children: Vec<usize>,
    effects: Vec<Effect>,
    frame: Option<usize>,
    value: String,
    checked: bool,
}

impl Node {
    fn attr(&self, name: &str) -> &str {
        self.attrs.get(name).map(String::as_str).unwrap_or("")
    }

    fn input_type(&self) -> String {
        self.attr("type").trim().to_ascii_lowercase()
    }

    fn is_toggle(&self) -> bool {
        self.tag == "input" && matches!(self.input_type().as_str(), "checkbox" | "radio")
    }
}

#[derive(Debug, Clone, Default)]
struct LiveDoc {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
struct Window {
    handle: String,
    url: String,
    docs: Vec<LiveDoc>,
    same_tab: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeAddr {
    window: usize,
    doc: usize,
    node: usize,
}

/// Provider operations, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomOp {
    Any,
    VisibleText,
    Query,
    IsDisplayed,
    Invoke,
    SetValue,
    SubmitForm,
    FormFields,
    Navigate,
    Refresh,
    PageSource,
    Screenshot,
    ListFrames,
    ListWindows,
    AcceptDialog,
    ExecInert,
    CookieHeader,
}

#[derive(Debug, Clone)]
struct InjectedFault {
    op: DomOp,
    err: DomError,
    remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomEventKind {
    Navigate(String),
    Refresh(String),
    Invoke { tag: String, text: String },
    SetValue { field: String, value: String },
    SelectOption { field: String, value: String },
    Submit { form: String },
    Exec(String),
    SwitchFrame,
    SwitchDefaultFrame,
    SwitchWindow(String),
    DialogAccepted(String),
    Screenshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomEvent {
    pub at: Option<NaiveDateTime>,
    pub kind: DomEventKind,
}

pub struct MemoryDom {
    site: HashMap<String, VecDeque<Document>>,
    windows: Vec<Window>,
    current: usize,
    frame_path: Vec<usize>,
    generation: u64,
    next_id: u64,
    refs: HashMap<u64, NodeAddr>,
    rev: HashMap<NodeAddr, u64>,
    dialogs: VecDeque<String>,
    faults: Vec<InjectedFault>,
    events: Vec<DomEvent>,
    cookies: String,
    network: Vec<NetworkEvent>,
    next_request: u64,
    window_seq: usize,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDom {
    pub fn new() -> Self {
        let mut dom = Self {
            site: HashMap::new(),
            windows: Vec::new(),
            current: 0,
            frame_path: Vec::new(),
            generation: 0,
            next_id: 0,
            refs: HashMap::new(),
            rev: HashMap::new(),
            dialogs: VecDeque::new(),
            faults: Vec::new(),
            events: Vec::new(),
            cookies: String::new(),
            network: Vec::new(),
            next_request: 0,
            window_seq: 0,
            clock: None,
        };
        let w = dom.new_window("about:blank", Document::default());
        dom.windows.push(w);
        dom
    }

    /// Timestamp recorded events with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Serve `doc` for `url` (appended to the URL's sequence).
    pub fn page(mut self, url: &str, doc: Document) -> Self {
        self.site.entry(url.to_string()).or_default().push_back(doc);
        self
    }

    /// Serve `docs` for `url`, one per load; the last one repeats.
    pub fn pages(mut self, url: &str, docs: impl IntoIterator<Item = Document>) -> Self {
        self.site.entry(url.to_string()).or_default().extend(docs);
        self
    }

    pub fn cookies(mut self, header: &str) -> Self {
        self.cookies = header.to_string();
        self
    }

    /// The next `op` fails with `err`.
    pub fn fail_next(&mut self, op: DomOp, err: DomError) {
        self.faults.push(InjectedFault {
            op,
            err,
            remaining: Some(1),
        });
    }

    /// Every later `op` fails with `err`.
    pub fn fail_always(&mut self, op: DomOp, err: DomError) {
        self.faults.push(InjectedFault {
            op,
            err,
            remaining: None,
        });
    }

    pub fn events(&self) -> &[DomEvent] {
        &self.events
    }

    pub fn refresh_times(&self) -> Vec<Option<NaiveDateTime>> {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, DomEventKind::Refresh(_)))
            .map(|e| e.at)
            .collect()
    }

    /// Field writes (set value / select option), in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.events
            .iter()
            .filter_map(|e| match &e.kind {
                DomEventKind::SetValue { field, value }
                | DomEventKind::SelectOption { field, value } => {
                    Some((field.clone(), value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Current value of the first field named or id'd `key` in the current
    /// document.
    pub fn field_value(&self, key: &str) -> Option<String> {
        let doc = self.doc();
        doc.nodes
            .iter()
            .find(|n| {
                matches!(n.tag.as_str(), "input" | "select" | "textarea")
                    && (n.attr("name") == key || n.attr("id") == key)
                    && !n.is_toggle()
            })
            .map(|n| n.value.clone())
    }

    /// Checked state of the toggle named `name` with value `value`.
    pub fn is_checked(&self, name: &str, value: &str) -> bool {
        self.doc().nodes.iter().any(|n| {
            n.is_toggle() && n.attr("name") == name && n.value == value && n.checked
        })
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    // ── internals ─────────────────────────────────────────────────────────

    fn record(&mut self, kind: DomEventKind) {
        let at = self.clock.as_ref().map(|c| c.now());
        self.events.push(DomEvent { at, kind });
    }

    fn fault(&mut self, op: DomOp) -> DomResult<()> {
        let hit = self
            .faults
            .iter()
            .position(|f| f.op == op || f.op == DomOp::Any);
        if let Some(i) = hit {
            let fault = &mut self.faults[i];
            let err = fault.err.clone();
            let exhausted = match fault.remaining.as_mut() {
                Some(n) if *n <= 1 => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
                None => false,
            };
            if exhausted {
                self.faults.remove(i);
            }
            return Err(err);
        }
        Ok(())
    }

    fn bump(&mut self) {
        self.generation += 1;
        self.refs.clear();
        self.rev.clear();
    }

    fn new_window(&mut self, url: &str, doc: Document) -> Window {
        let handle = format!("w{}", self.window_seq);
        self.window_seq += 1;
        let mut w = Window {
            handle,
            url: url.to_string(),
            docs: Vec::new(),
            same_tab: false,
        };
        build_doc(&mut w.docs, &doc);
        w
    }

    fn fetch(&mut self, url: &str) -> Document {
        match self.site.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Document::text("404 Not Found"),
        }
    }

    /// Request/response pair for one document load. 404 for unknown URLs.
    fn record_load(&mut self, url: &str) {
        self.next_request += 1;
        let request_id = self.next_request.to_string();
        let timestamp = self
            .clock
            .as_ref()
            .map(|c| c.now().and_utc().timestamp_millis() as f64 / 1000.0)
            .unwrap_or(self.next_request as f64);
        let status = if self.site.contains_key(url) { 200 } else { 404 };
        self.network.push(NetworkEvent {
            method: "Network.requestWillBeSent".into(),
            request_id: request_id.clone(),
            url: url.to_string(),
            http_method: Some("GET".into()),
            status: None,
            mime_type: None,
            error: None,
            timestamp,
        });
        self.network.push(NetworkEvent {
            method: "Network.responseReceived".into(),
            request_id,
            url: url.to_string(),
            http_method: None,
            status: Some(status),
            mime_type: Some("text/html".into()),
            error: None,
            timestamp,
        });
    }

    fn load(&mut self, url: &str) {
        self.record_load(url);
        let doc = self.fetch(url);
        let w = &mut self.windows[self.current];
        w.url = url.to_string();
        w.docs.clear();
        w.same_tab = false;
        build_doc(&mut w.docs, &doc);
        self.frame_path.clear();
        self.bump();
    }

    fn doc_index(&self) -> usize {
        self.frame_path.last().copied().unwrap_or(0)
    }

    fn doc(&self) -> &LiveDoc {
        &self.windows[self.current].docs[self.doc_index()]
    }

    fn addr(&self, control: &Control) -> DomResult<NodeAddr> {
        if control.generation() != self.generation {
            return Err(DomError::Stale);
        }
        self.refs.get(&control.id()).copied().ok_or(DomError::Stale)
    }

    fn node(&self, a: NodeAddr) -> &Node {
        &self.windows[a.window].docs[a.doc].nodes[a.node]
    }

    fn node_mut(&mut self, a: NodeAddr) -> &mut Node {
        &mut self.windows[a.window].docs[a.doc].nodes[a.node]
    }

    fn control_for(&mut self, a: NodeAddr) -> Control {
        let id = match self.rev.get(&a) {
            Some(id) => *id,
            None => {
                self.next_id += 1;
                let id = self.next_id;
                self.refs.insert(id, a);
                self.rev.insert(a, id);
                id
            }
        };
        let doc = &self.windows[a.window].docs[a.doc];
        Control::new(id, self.generation, &doc.nodes[a.node].tag, control_text(doc, a.node))
    }

    fn here(&self, node: usize) -> NodeAddr {
        NodeAddr {
            window: self.current,
            doc: self.doc_index(),
            node,
        }
    }

    /// Descendants of `root` in the current document matching `pattern`.
    fn matching(&self, root: usize, pattern: &Pattern) -> Vec<usize> {
        let doc = self.doc();
        let mut out = Vec::new();
        let mut order = Vec::new();
        preorder(doc, root, &mut order);
        for idx in order {
            if idx == root {
                continue;
            }
            let n = &doc.nodes[idx];
            let ancestors = ancestor_classes(doc, idx);
            let refs: Vec<&str> = ancestors.iter().map(String::as_str).collect();
            if pattern.accepts(&n.tag, &n.attrs, &refs) {
                out.push(idx);
            }
        }
        out
    }

    fn field_key(&self, a: NodeAddr) -> String {
        let n = self.node(a);
        let name = n.attr("name");
        if name.is_empty() {
            n.attr("id").to_string()
        } else {
            name.to_string()
        }
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) -> DomResult<()> {
        for effect in effects {
            match effect {
                Effect::Dialog(msg) => self.dialogs.push_back(msg),
                Effect::Navigate(url) => {
                    self.load(&url);
                }
                Effect::OpenWindow(url) => {
                    if self.windows[self.current].same_tab {
                        self.load(&url);
                    } else {
                        let doc = self.fetch(&url);
                        let w = self.new_window(&url, doc);
                        self.windows.push(w);
                    }
                }
                Effect::Fail(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn submit(&mut self, form: NodeAddr) -> DomResult<()> {
        let key = self.field_key(form);
        self.record(DomEventKind::Submit { form: key });
        let n = self.node(form);
        let effects = n.effects.clone();
        let action = n.attr("action").to_string();
        if effects.is_empty() && !action.is_empty() {
            let url = self.resolve(&action);
            self.load(&url);
            return Ok(());
        }
        self.apply_effects(effects)
    }

    fn resolve(&self, href: &str) -> String {
        let base = &self.windows[self.current].url;
        match url::Url::parse(base).and_then(|b| b.join(href)) {
            Ok(u) => u.to_string(),
            Err(_) => href.to_string(),
        }
    }

    fn enclosing_form(&self, a: NodeAddr) -> Option<NodeAddr> {
        let doc = &self.windows[a.window].docs[a.doc];
        let mut cur = doc.nodes[a.node].parent;
        while let Some(i) = cur {
            if doc.nodes[i].tag == "form" {
                return Some(NodeAddr { node: i, ..a });
            }
            cur = doc.nodes[i].parent;
        }
        None
    }
}

fn build_doc(docs: &mut Vec<LiveDoc>, doc: &Document) -> usize {
    let idx = docs.len();
    docs.push(LiveDoc::default());
    let body = Node {
        tag: "body".into(),
        attrs: BTreeMap::new(),
        text: String::new(),
        hidden: false,
        parent: None,
        children: Vec::new(),
        effects: Vec::new(),
        frame: None,
        value: String::new(),
        checked: false,
    };
    docs[idx].nodes.push(body);
    for el in &doc.body {
        add_node(docs, idx, 0, el);
    }
    idx
}

fn add_node(docs: &mut Vec<LiveDoc>, doc: usize, parent: usize, el: &Element) {
    let frame = el.frame.as_ref().map(|d| build_doc(docs, d));
    let is_toggle = el.tag == "input"
        && matches!(
            el.attrs.get("type").map(|t| t.to_ascii_lowercase()).as_deref(),
            Some("checkbox") | Some("radio")
        );
    let value = match el.tag.as_str() {
        "textarea" => el.text.clone(),
        "option" => el.attrs.get("value").cloned().unwrap_or_else(|| el.text.clone()),
        "select" => el
            .children
            .iter()
            .filter(|c| c.tag == "option")
            .find(|c| c.attrs.contains_key("selected"))
            .or_else(|| el.children.iter().find(|c| c.tag == "option"))
            .map(|c| c.attrs.get("value").cloned().unwrap_or_else(|| c.text.clone()))
            .unwrap_or_default(),
        _ => el.attrs.get("value").cloned().unwrap_or_default(),
    };
    let node = Node {
        tag: el.tag.clone(),
        attrs: el.attrs.clone(),
        text: el.text.clone(),
        hidden: el.hidden,
        parent: Some(parent),
        children: Vec::new(),
        effects: el.effects.clone(),
        frame,
        value,
        checked: is_toggle && el.attrs.contains_key("checked"),
    };
    let idx = docs[doc].nodes.len();
    docs[doc].nodes.push(node);
    docs[doc].nodes[parent].children.push(idx);
    for c in &el.children {
        add_node(docs, doc, idx, c);
    }
}

fn preorder(doc: &LiveDoc, idx: usize, out: &mut Vec<usize>) {
    out.push(idx);
    for &c in &doc.nodes[idx].children {
        preorder(doc, c, out);
    }
}

fn ancestor_classes(doc: &LiveDoc, idx: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = doc.nodes[idx].parent;
    while let Some(i) = cur {
        out.push(doc.nodes[i].attr("class").to_string());
        cur = doc.nodes[i].parent;
    }
    out
}

fn displayed(doc: &LiveDoc, idx: usize) -> bool {
    let mut cur = Some(idx);
    while let Some(i) = cur {
        let n = &doc.nodes[i];
        if n.hidden || (n.tag == "input" && n.input_type() == "hidden") {
            return false;
        }
        cur = n.parent;
    }
    true
}

fn subtree_text(doc: &LiveDoc, idx: usize, out: &mut Vec<String>) {
    let n = &doc.nodes[idx];
    if n.hidden {
        return;
    }
    if !n.text.trim().is_empty() {
        out.push(n.text.trim().to_string());
    }
    for &c in &n.children {
        subtree_text(doc, c, out);
    }
}

fn normalize(parts: Vec<String>) -> String {
    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn control_text(doc: &LiveDoc, idx: usize) -> String {
    let n = &doc.nodes[idx];
    if n.tag == "input" {
        return n.value.trim().to_string();
    }
    let mut parts = Vec::new();
    subtree_text(doc, idx, &mut parts);
    normalize(parts)
}

fn label_for(doc: &LiveDoc, idx: usize) -> String {
    let id = doc.nodes[idx].attr("id");
    if !id.is_empty() {
        if let Some(l) = doc
            .nodes
            .iter()
            .position(|n| n.tag == "label" && n.attr("for") == id)
        {
            return control_text(doc, l);
        }
    }
    let mut cur = doc.nodes[idx].parent;
    while let Some(i) = cur {
        if doc.nodes[i].tag == "label" {
            return control_text(doc, i);
        }
        cur = doc.nodes[i].parent;
    }
    let mut order = Vec::new();
    preorder(doc, 0, &mut order);
    order
        .iter()
        .take_while(|&&i| i != idx)
        .filter(|&&i| doc.nodes[i].tag == "label")
        .last()
        .map(|&i| control_text(doc, i))
        .unwrap_or_default()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn serialize(doc: &LiveDoc, idx: usize, out: &mut String) {
    let n = &doc.nodes[idx];
    out.push('<');
    out.push_str(&n.tag);
    for (k, v) in &n.attrs {
        if k == "value" {
            continue;
        }
        out.push_str(&format!(" {}=\"{}\"", k, html_escape(v)));
    }
    if matches!(n.tag.as_str(), "input" | "option") || (!n.value.is_empty() && n.tag != "select" && n.tag != "textarea") {
        out.push_str(&format!(" value=\"{}\"", html_escape(&n.value)));
    }
    if n.checked {
        out.push_str(" checked");
    }
    out.push('>');
    if n.tag == "textarea" {
        out.push_str(&html_escape(&n.value));
    } else {
        out.push_str(&html_escape(&n.text));
    }
    for &c in &n.children {
        serialize(doc, c, out);
    }
    out.push_str("</");
    out.push_str(&n.tag);
    out.push('>');
}

#[async_trait]
impl DomProvider for MemoryDom {
    async fn visible_text(&mut self, region: Option<&Control>) -> DomResult<String> {
        self.fault(DomOp::VisibleText)?;
        match region {
            Some(c) => {
                let a = self.addr(c)?;
                Ok(control_text(&self.windows[a.window].docs[a.doc], a.node))
            }
            None => {
                let mut parts = Vec::new();
                subtree_text(self.doc(), 0, &mut parts);
                Ok(normalize(parts))
            }
        }
    }

    async fn query(&mut self, pattern: &Pattern) -> DomResult<Vec<Control>> {
        self.fault(DomOp::Query)?;
        let found = self.matching(0, pattern);
        Ok(found
            .into_iter()
            .map(|i| {
                let a = self.here(i);
                self.control_for(a)
            })
            .collect())
    }

    async fn query_within(&mut self, scope: &Control, pattern: &Pattern) -> DomResult<Vec<Control>> {
        self.fault(DomOp::Query)?;
        let a = self.addr(scope)?;
        let found = self.matching(a.node, pattern);
        Ok(found
            .into_iter()
            .map(|i| {
                let a = self.here(i);
                self.control_for(a)
            })
            .collect())
    }

    async fn is_displayed(&mut self, control: &Control) -> DomResult<bool> {
        self.fault(DomOp::IsDisplayed)?;
        let a = self.addr(control)?;
        Ok(displayed(&self.windows[a.window].docs[a.doc], a.node))
    }

    async fn parent(&mut self, control: &Control) -> DomResult<Option<Control>> {
        let a = self.addr(control)?;
        match self.node(a).parent {
            Some(p) if p != 0 => Ok(Some(self.control_for(NodeAddr { node: p, ..a }))),
            _ => Ok(None),
        }
    }

    async fn attribute(&mut self, control: &Control, name: &str) -> DomResult<Option<String>> {
        let a = self.addr(control)?;
        let n = self.node(a);
        if name.eq_ignore_ascii_case("value") && matches!(n.tag.as_str(), "input" | "select" | "textarea") {
            return Ok(Some(n.value.clone()));
        }
        Ok(n.attrs.get(&name.to_ascii_lowercase()).cloned())
    }

    async fn scroll_into_view(&mut self, control: &Control) -> DomResult<()> {
        self.addr(control)?;
        Ok(())
    }

    async fn invoke(&mut self, control: &Control) -> DomResult<()> {
        self.fault(DomOp::Invoke)?;
        let a = self.addr(control)?;
        let n = self.node(a).clone();
        self.record(DomEventKind::Invoke {
            tag: n.tag.clone(),
            text: control.text.clone(),
        });

        if n.is_toggle() {
            if n.input_type() == "radio" {
                let name = n.attr("name").to_string();
                let doc = &mut self.windows[a.window].docs[a.doc];
                for other in doc.nodes.iter_mut() {
                    if other.is_toggle() && other.input_type() == "radio" && other.attr("name") == name {
                        other.checked = false;
                    }
                }
                self.node_mut(a).checked = true;
            } else {
                let node = self.node_mut(a);
                node.checked = !node.checked;
            }
        }

        if !n.effects.is_empty() {
            return self.apply_effects(n.effects);
        }

        let ty = n.input_type();
        let submits = (n.tag == "input" && ty == "submit")
            || (n.tag == "button" && (ty.is_empty() || ty == "submit"));
        if submits {
            if let Some(form) = self.enclosing_form(a) {
                return self.submit(form);
            }
        }
        if n.tag == "a" {
            let href = n.attr("href").trim().to_string();
            if !href.is_empty() && !href.starts_with('#') && !href.to_lowercase().starts_with("javascript:") {
                let url = self.resolve(&href);
                if n.attr("target") == "_blank" && !self.windows[self.current].same_tab {
                    return self.apply_effects(vec![Effect::OpenWindow(url)]);
                }
                self.load(&url);
            }
        }
        Ok(())
    }

    async fn set_value(&mut self, control: &Control, value: &str) -> DomResult<()> {
        self.fault(DomOp::SetValue)?;
        let a = self.addr(control)?;
        let field = self.field_key(a);
        self.node_mut(a).value = value.to_string();
        self.record(DomEventKind::SetValue {
            field,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn select_option(&mut self, control: &Control, value: &str) -> DomResult<()> {
        self.fault(DomOp::SetValue)?;
        let a = self.addr(control)?;
        let doc = &self.windows[a.window].docs[a.doc];
        let exists = doc.nodes[a.node]
            .children
            .iter()
            .any(|&c| doc.nodes[c].tag == "option" && doc.nodes[c].value == value);
        if !exists {
            return Err(DomError::Script(format!("option not found: {value}")));
        }
        let field = self.field_key(a);
        self.node_mut(a).value = value.to_string();
        self.record(DomEventKind::SelectOption {
            field,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn submit_form(&mut self, form: &Control) -> DomResult<()> {
        self.fault(DomOp::SubmitForm)?;
        let a = self.addr(form)?;
        if self.node(a).tag != "form" {
            return Err(DomError::Script("not a form".into()));
        }
        self.submit(a)
    }

    async fn form_fields(&mut self, form: &Control) -> DomResult<Vec<ScannedField>> {
        self.fault(DomOp::FormFields)?;
        let a = self.addr(form)?;
        let pattern = Pattern::tags(&["input", "select", "textarea"]);
        let found = self.matching(a.node, &pattern);
        let mut out = Vec::with_capacity(found.len());
        for idx in found {
            let addr = self.here(idx);
            let control = self.control_for(addr);
            let doc = self.doc();
            let n = &doc.nodes[idx];
            let Some(tag) = TagKind::parse(&n.tag) else {
                continue;
            };
            let options = if n.tag == "select" {
                n.children
                    .iter()
                    .filter(|&&c| doc.nodes[c].tag == "option")
                    .map(|&c| SelectOption {
                        value: doc.nodes[c].value.clone(),
                        text: control_text(doc, c),
                        selected: doc.nodes[c].value == n.value,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            out.push(ScannedField {
                control,
                descriptor: FieldDescriptor {
                    tag,
                    input_kind: InputKind::parse(n.attr("type")),
                    name: n.attr("name").to_string(),
                    id: n.attr("id").to_string(),
                    placeholder: n.attr("placeholder").to_string(),
                    label: label_for(doc, idx),
                    required: n.attrs.contains_key("required"),
                },
                state: FieldState {
                    value: n.value.clone(),
                    checked: n.checked,
                    readonly: n.attrs.contains_key("readonly"),
                    disabled: n.attrs.contains_key("disabled"),
                    options,
                },
            });
        }
        Ok(out)
    }

    async fn navigate(&mut self, url: &str) -> DomResult<()> {
        self.fault(DomOp::Navigate)?;
        self.record(DomEventKind::Navigate(url.to_string()));
        self.load(url);
        Ok(())
    }

    async fn refresh(&mut self) -> DomResult<()> {
        self.fault(DomOp::Refresh)?;
        let url = self.windows[self.current].url.clone();
        self.record(DomEventKind::Refresh(url.clone()));
        self.load(&url);
        Ok(())
    }

    async fn current_url(&mut self) -> DomResult<String> {
        Ok(self.windows[self.current].url.clone())
    }

    async fn page_source(&mut self) -> DomResult<String> {
        self.fault(DomOp::PageSource)?;
        let mut out = String::from("<html>");
        serialize(self.doc(), 0, &mut out);
        out.push_str("</html>");
        Ok(out)
    }

    async fn screenshot(&mut self) -> DomResult<Vec<u8>> {
        self.fault(DomOp::Screenshot)?;
        self.record(DomEventKind::Screenshot);
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(self.windows[self.current].url.as_bytes());
        Ok(png)
    }

    async fn list_frames(&mut self) -> DomResult<Vec<Control>> {
        self.fault(DomOp::ListFrames)?;
        let found = self.matching(0, &Pattern::tags(&["iframe", "frame"]));
        Ok(found
            .into_iter()
            .map(|i| {
                let a = self.here(i);
                self.control_for(a)
            })
            .collect())
    }

    async fn switch_frame(&mut self, frame: &Control) -> DomResult<()> {
        let a = self.addr(frame)?;
        let target = self
            .node(a)
            .frame
            .ok_or_else(|| DomError::Script("frame document unavailable".into()))?;
        self.frame_path.push(target);
        self.bump();
        self.record(DomEventKind::SwitchFrame);
        Ok(())
    }

    async fn switch_default_frame(&mut self) -> DomResult<()> {
        if !self.frame_path.is_empty() {
            self.frame_path.clear();
            self.bump();
            self.record(DomEventKind::SwitchDefaultFrame);
        }
        Ok(())
    }

    async fn list_windows(&mut self) -> DomResult<Vec<WindowHandle>> {
        self.fault(DomOp::ListWindows)?;
        Ok(self
            .windows
            .iter()
            .map(|w| WindowHandle(w.handle.clone()))
            .collect())
    }

    async fn switch_window(&mut self, handle: &WindowHandle) -> DomResult<()> {
        let idx = self
            .windows
            .iter()
            .position(|w| w.handle == handle.0)
            .ok_or_else(|| DomError::Script(format!("no such window: {}", handle.0)))?;
        self.current = idx;
        self.frame_path.clear();
        self.bump();
        self.record(DomEventKind::SwitchWindow(handle.0.clone()));
        Ok(())
    }

    async fn accept_dialog(&mut self, _timeout: Duration) -> DomResult<Option<String>> {
        self.fault(DomOp::AcceptDialog)?;
        let msg = self.dialogs.pop_front();
        if let Some(m) = &msg {
            self.record(DomEventKind::DialogAccepted(m.clone()));
        }
        Ok(msg)
    }

    async fn exec_inert(&mut self, script: &str) -> DomResult<()> {
        self.fault(DomOp::ExecInert)?;
        if script == scripts::SAME_TAB_POLICY {
            self.windows[self.current].same_tab = true;
        }
        self.record(DomEventKind::Exec(script.to_string()));
        Ok(())
    }

    async fn cookie_header(&mut self) -> DomResult<String> {
        self.fault(DomOp::CookieHeader)?;
        Ok(self.cookies.clone())
    }

    async fn network_log(&mut self) -> DomResult<Vec<NetworkEvent>> {
        Ok(std::mem::take(&mut self.network))
    }
}
