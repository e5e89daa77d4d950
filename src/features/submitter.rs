//! Submission: pick the control that sends the current form.
//!
//! Order of preference:
//! 1. a submit-like control inside a visible form,
//! 2. a page-level apply anchor,
//! 3. a page-level button carrying submit wording,
//! 4. a scripted `form.submit()` on the named form, else the first form.

use serde::Serialize;
use tracing::{debug, info};

use super::invoker::{ClickResult, Invoker};
use crate::browser::{displayed, Control, DomProvider, Pattern};
use crate::core::error::{tolerate, EngineError};

/// Wording that marks a control as the one that sends the form.
pub const SUBMIT_KEYWORDS: &[&str] = &["신청", "접수", "제출", "등록", "확인", "submit", "apply"];
/// Page buttons only count with one of these.
pub const PAGE_BUTTON_KEYWORDS: &[&str] = &["신청", "제출", "등록", "확인"];
pub const APPLY_ANCHOR_TEXT: &str = "신청하기";
/// Legacy apply handlers are wired through this script name.
pub const APPLY_HANDLER_HINT: &str = "checkIt";
pub const PREFERRED_FORM_NAME: &str = "myform";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMethod {
    FormControl,
    PageAnchor,
    PageButton,
    ScriptedSubmit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub method: SubmitMethod,
    pub dialog: Option<String>,
}

fn has_any(text: &str, words: &[&str]) -> bool {
    let text = text.to_lowercase();
    words.iter().any(|w| text.contains(w))
}

fn form_buttons() -> Pattern {
    Pattern::tags(&["button", "input"]).input_types(&["submit", "button"])
}

async fn click_first<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    candidates: Vec<Control>,
) -> Result<bool, EngineError> {
    for c in candidates {
        match inv.safe_click(dom, &c).await? {
            ClickResult::Clicked => return Ok(true),
            other => debug!("submitter: {:?} on {:?}", other, c.text),
        }
    }
    Ok(false)
}

async fn submit_via_form_controls<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    forms: &[Control],
) -> Result<bool, EngineError> {
    for form in forms {
        let Some(buttons) = tolerate("form buttons", displayed(dom, Some(form), &form_buttons()).await)?
        else {
            continue;
        };
        if buttons.is_empty() {
            continue;
        }
        let (preferred, rest): (Vec<_>, Vec<_>) = buttons
            .into_iter()
            .partition(|b| has_any(&b.text, SUBMIT_KEYWORDS));
        let ordered = if preferred.is_empty() { rest } else { preferred };
        if click_first(dom, inv, ordered).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn submit_via_page_anchor<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
) -> Result<bool, EngineError> {
    let Some(anchors) = tolerate("anchors", displayed(dom, None, &Pattern::tags(&["a"])).await)? else {
        return Ok(false);
    };
    let mut picked = Vec::new();
    for a in anchors {
        let href = tolerate("attribute", dom.attribute(&a, "href").await)?
            .flatten()
            .unwrap_or_default();
        if href.contains(APPLY_HANDLER_HINT) || a.text.contains(APPLY_ANCHOR_TEXT) {
            picked.push(a);
        }
    }
    click_first(dom, inv, picked).await
}

async fn submit_via_page_button<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
) -> Result<bool, EngineError> {
    let Some(buttons) = tolerate("page buttons", displayed(dom, None, &form_buttons()).await)? else {
        return Ok(false);
    };
    let picked: Vec<_> = buttons
        .into_iter()
        .filter(|b| has_any(&b.text, PAGE_BUTTON_KEYWORDS))
        .collect();
    click_first(dom, inv, picked).await
}

async fn scripted_submit<D: DomProvider + ?Sized>(
    dom: &mut D,
    forms: &[Control],
) -> Result<bool, EngineError> {
    let mut target = None;
    for f in forms {
        let name = tolerate("attribute", dom.attribute(f, "name").await)?.flatten();
        if name.as_deref() == Some(PREFERRED_FORM_NAME) {
            target = Some(f.clone());
            break;
        }
    }
    let Some(form) = target.or_else(|| forms.first().cloned()) else {
        return Ok(false);
    };
    Ok(tolerate("submit_form", dom.submit_form(&form).await)?.is_some())
}

/// Send the form in the current context. `None` when nothing could be
/// submitted. The dialog accepted afterwards, if any, is returned so the
/// caller can read throttling language out of it.
pub async fn submit_current_form<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    dialog_timeout: std::time::Duration,
) -> Result<Option<Submission>, EngineError> {
    let forms = tolerate("forms", dom.query(&Pattern::tags(&["form"])).await)?.unwrap_or_default();

    let method = if submit_via_form_controls(dom, inv, &forms).await? {
        Some(SubmitMethod::FormControl)
    } else if submit_via_page_anchor(dom, inv).await? {
        Some(SubmitMethod::PageAnchor)
    } else if submit_via_page_button(dom, inv).await? {
        Some(SubmitMethod::PageButton)
    } else if scripted_submit(dom, &forms).await? {
        Some(SubmitMethod::ScriptedSubmit)
    } else {
        None
    };

    let Some(method) = method else {
        info!("submitter: nothing to submit on this page");
        return Ok(None);
    };
    let dialog = inv.accept_dialog(dom, dialog_timeout).await?;
    info!("submitter: submitted via {:?}", method);
    Ok(Some(Submission { method, dialog }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{button, input, link, DomEventKind, Document, Effect, Element, MemoryDom};
    use crate::core::config::TimingConfig;
    use crate::engine::clock::{ManualClock, Pacer};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    const URL: &str = "https://example.test/parent/Appchild_regist.asp?sn=108";
    const DONE: &str = "https://example.test/parent/Appchild_regist_ok.asp";

    fn pacer() -> Pacer {
        let t0 = NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        Pacer::unattended(Arc::new(ManualClock::new(t0)))
    }

    async fn at(doc: Document) -> MemoryDom {
        let mut dom = MemoryDom::new()
            .page(URL, doc)
            .page(DONE, Document::text("신청이 완료되었습니다"));
        dom.navigate(URL).await.unwrap();
        dom
    }

    fn submitted(dom: &MemoryDom) -> bool {
        dom.events()
            .iter()
            .any(|e| matches!(e.kind, DomEventKind::Submit { .. }))
    }

    #[tokio::test]
    async fn prefers_submit_wording_inside_the_form() {
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let mut dom = at(Document::new([Element::new("form").attr("action", DONE).children([
            input("text", "name"),
            Element::new("input").attr("type", "button").value("취소"),
            Element::new("input")
                .attr("type", "submit")
                .value("신청하기"),
        ])]))
        .await;
        let s = submit_current_form(&mut dom, &inv, Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.method, SubmitMethod::FormControl);
        assert_eq!(dom.current_url().await.unwrap(), DONE);
    }

    #[tokio::test]
    async fn falls_back_to_any_form_button_and_reports_dialog() {
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let mut dom = at(Document::new([Element::new("form").child(
            button("OK").on_invoke(Effect::Dialog("잠시 후 다시 시도해 주세요".into())),
        )]))
        .await;
        let s = submit_current_form(&mut dom, &inv, Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.method, SubmitMethod::FormControl);
        assert_eq!(s.dialog.as_deref(), Some("잠시 후 다시 시도해 주세요"));
    }

    #[tokio::test]
    async fn page_anchor_with_apply_handler() {
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let mut dom = at(Document::new([
            Element::new("form").child(input("text", "name")),
            link("다음", "javascript:checkIt()").on_invoke(Effect::Navigate(DONE.into())),
        ]))
        .await;
        let s = submit_current_form(&mut dom, &inv, Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.method, SubmitMethod::PageAnchor);
        assert_eq!(dom.current_url().await.unwrap(), DONE);
    }

    #[tokio::test]
    async fn scripted_submit_targets_the_named_form() {
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let mut dom = at(Document::new([
            Element::new("form").name("search"),
            Element::new("form").name("myform").attr("action", DONE),
        ]))
        .await;
        let s = submit_current_form(&mut dom, &inv, Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.method, SubmitMethod::ScriptedSubmit);
        assert!(submitted(&dom));
        assert_eq!(dom.current_url().await.unwrap(), DONE);
    }

    #[tokio::test]
    async fn nothing_to_submit() {
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let mut dom = at(Document::text("안내 페이지")).await;
        assert!(submit_current_form(&mut dom, &inv, Duration::from_secs(3))
            .await
            .unwrap()
            .is_none());
    }
}
