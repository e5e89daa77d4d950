//! The page-query seam.
//!
//! Everything the engine knows about a page goes through [`DomProvider`]. Two
//! implementations ship with the crate:
//! * [`chromium::ChromiumDom`]: a real browser driven over CDP.
//! * [`memory::MemoryDom`]: an in-memory page model for dry runs and tests.

pub mod browser_manager;
pub mod chromium;
pub mod memory;
pub mod scripts;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::error::DomResult;
use crate::core::types::{FieldDescriptor, FieldState};

/// Reference to a page element, valid for one page generation only.
///
/// Any navigate, refresh, frame switch or window switch bumps the provider's
/// generation, and every later use of an older `Control` fails with
/// `DomError::Stale`. Never cache one across ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    id: u64,
    generation: u64,
    /// Lower-case tag name.
    pub tag: String,
    /// Visible text at query time (the `value` attribute for inputs).
    pub text: String,
}

impl Control {
    pub fn new(id: u64, generation: u64, tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            generation,
            tag: tag.into().to_ascii_lowercase(),
            text: text.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_clickable(&self) -> bool {
        matches!(self.tag.as_str(), "a" | "button")
    }
}

/// One `Network.*` event seen by the browser, kept for the per-session
/// network log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkEvent {
    /// CDP event name, e.g. `Network.responseReceived`.
    pub method: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Monotonic CDP timestamp in seconds.
    pub timestamp: f64,
}

/// Browser window or tab handle, in open order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WindowHandle(pub String);

/// A form field found by [`DomProvider::form_fields`].
#[derive(Debug, Clone)]
pub struct ScannedField {
    pub control: Control,
    pub descriptor: FieldDescriptor,
    pub state: FieldState,
}

/// Structural element query. Every populated criterion must hold.
///
/// Text predicates are deliberately absent: the classifier decides on text in
/// Rust so the rules stay testable without a browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pattern {
    /// Lower-case tag names. Empty matches any tag.
    pub tags: Vec<String>,
    /// Allowed `type` values for `input` elements. Empty allows any.
    pub input_types: Vec<String>,
    /// Substring of the element's own `class` attribute.
    pub class_contains: Option<String>,
    /// Substring of some ancestor's `class` attribute.
    pub ancestor_class: Option<String>,
    /// `(attribute, needle)` pairs; the attribute value must contain the
    /// needle, case-insensitively.
    pub attr_contains: Vec<(String, String)>,
}

impl Pattern {
    pub fn tags(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_ascii_lowercase()).collect(),
            ..Self::default()
        }
    }

    pub fn input_types(mut self, types: &[&str]) -> Self {
        self.input_types = types.iter().map(|t| t.to_ascii_lowercase()).collect();
        self
    }

    pub fn class_contains(mut self, needle: &str) -> Self {
        self.class_contains = Some(needle.to_string());
        self
    }

    pub fn within_class(mut self, needle: &str) -> Self {
        self.ancestor_class = Some(needle.to_string());
        self
    }

    pub fn attr_contains(mut self, attr: &str, needle: &str) -> Self {
        self.attr_contains
            .push((attr.to_ascii_lowercase(), needle.to_lowercase()));
        self
    }

    /// Evaluate the pattern against one element.
    ///
    /// `ancestor_classes` lists the `class` attribute of every ancestor,
    /// nearest first.
    pub fn accepts(
        &self,
        tag: &str,
        attrs: &BTreeMap<String, String>,
        ancestor_classes: &[&str],
    ) -> bool {
        let tag = tag.to_ascii_lowercase();
        if !self.tags.is_empty() && !self.tags.iter().any(|t| *t == tag) {
            return false;
        }
        if tag == "input" && !self.input_types.is_empty() {
            let ty = attrs
                .get("type")
                .map(|t| t.trim().to_ascii_lowercase())
                .unwrap_or_default();
            if !self.input_types.iter().any(|t| *t == ty) {
                return false;
            }
        }
        if let Some(needle) = &self.class_contains {
            let class = attrs.get("class").map(String::as_str).unwrap_or("");
            if !class.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.ancestor_class {
            if !ancestor_classes.iter().any(|c| c.contains(needle.as_str())) {
                return false;
            }
        }
        self.attr_contains.iter().all(|(attr, needle)| {
            attrs
                .get(attr)
                .map(|v| v.to_lowercase().contains(needle.as_str()))
                .unwrap_or(false)
        })
    }
}

/// Page-query provider owned exclusively by one session.
///
/// Lookups that find nothing return empty/`None`; `Err` is reserved for real
/// faults (stale reference, intercepted click, script failure, disconnect).
#[async_trait]
pub trait DomProvider: Send {
    /// Visible text of `region`, or of the whole current document.
    async fn visible_text(&mut self, region: Option<&Control>) -> DomResult<String>;
    /// All elements of the current document matching `pattern`, in document
    /// order, displayed or not.
    async fn query(&mut self, pattern: &Pattern) -> DomResult<Vec<Control>>;
    async fn query_within(&mut self, scope: &Control, pattern: &Pattern)
        -> DomResult<Vec<Control>>;
    async fn is_displayed(&mut self, control: &Control) -> DomResult<bool>;
    async fn parent(&mut self, control: &Control) -> DomResult<Option<Control>>;
    async fn attribute(&mut self, control: &Control, name: &str) -> DomResult<Option<String>>;
    async fn scroll_into_view(&mut self, control: &Control) -> DomResult<()>;
    async fn invoke(&mut self, control: &Control) -> DomResult<()>;
    async fn set_value(&mut self, control: &Control, value: &str) -> DomResult<()>;
    async fn select_option(&mut self, control: &Control, value: &str) -> DomResult<()>;
    /// Scripted `form.submit()`, bypassing submit controls.
    async fn submit_form(&mut self, form: &Control) -> DomResult<()>;
    async fn form_fields(&mut self, form: &Control) -> DomResult<Vec<ScannedField>>;

    async fn navigate(&mut self, url: &str) -> DomResult<()>;
    async fn refresh(&mut self) -> DomResult<()>;
    async fn current_url(&mut self) -> DomResult<String>;
    async fn page_source(&mut self) -> DomResult<String>;
    /// PNG bytes of the current viewport.
    async fn screenshot(&mut self) -> DomResult<Vec<u8>>;

    /// Embedded frames of the current document.
    async fn list_frames(&mut self) -> DomResult<Vec<Control>>;
    async fn switch_frame(&mut self, frame: &Control) -> DomResult<()>;
    async fn switch_default_frame(&mut self) -> DomResult<()>;
    async fn list_windows(&mut self) -> DomResult<Vec<WindowHandle>>;
    async fn switch_window(&mut self, handle: &WindowHandle) -> DomResult<()>;

    /// Accept the pending dialog, waiting up to `timeout` for one to appear.
    async fn accept_dialog(&mut self, timeout: Duration) -> DomResult<Option<String>>;
    /// Run a script for its side effects only. Doubles as the liveness probe.
    async fn exec_inert(&mut self, script: &str) -> DomResult<()>;
    /// `name=value; ...` for the current origin.
    async fn cookie_header(&mut self) -> DomResult<String>;
    /// Drain the network events recorded since the last call.
    async fn network_log(&mut self) -> DomResult<Vec<NetworkEvent>> {
        Ok(Vec::new())
    }
}

/// Elements of `pattern` that are displayed, in document order.
pub async fn displayed<D: DomProvider + ?Sized>(
    dom: &mut D,
    scope: Option<&Control>,
    pattern: &Pattern,
) -> DomResult<Vec<Control>> {
    let found = match scope {
        Some(s) => dom.query_within(s, pattern).await?,
        None => dom.query(pattern).await?,
    };
    let mut out = Vec::with_capacity(found.len());
    for c in found {
        if dom.is_displayed(&c).await? {
            out.push(c);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tag_and_input_type_filters() {
        let p = Pattern::tags(&["input"]).input_types(&["button", "submit"]);
        assert!(p.accepts("INPUT", &attrs(&[("type", "Submit")]), &[]));
        assert!(!p.accepts("input", &attrs(&[("type", "text")]), &[]));
        assert!(!p.accepts("input", &attrs(&[]), &[]));
        assert!(!p.accepts("a", &attrs(&[]), &[]));
    }

    #[test]
    fn ancestor_and_own_class_filters() {
        let scoped = Pattern::tags(&["a", "button"]).within_class("btn-grp");
        assert!(scoped.accepts("a", &attrs(&[]), &["", "btn-grp right"]));
        assert!(!scoped.accepts("a", &attrs(&[]), &["content"]));

        let status = Pattern::tags(&["span"]).class_contains("status");
        assert!(status.accepts("span", &attrs(&[("class", "item-status on")]), &[]));
        assert!(!status.accepts("span", &attrs(&[("class", "label")]), &[]));
    }

    #[test]
    fn attribute_filters_are_case_insensitive() {
        let p = Pattern::tags(&["img"]).attr_contains("src", "CAPTCHA");
        assert!(p.accepts("img", &attrs(&[("src", "/img/Captcha.php?x=1")]), &[]));
        assert!(!p.accepts("img", &attrs(&[("alt", "captcha")]), &[]));
    }

    #[test]
    fn control_tag_is_lower_cased() {
        let c = Control::new(1, 0, "BUTTON", "신청");
        assert_eq!(c.tag, "button");
        assert!(c.is_clickable());
    }
}
