//! Read-only form probe: click the apply control once and record what the
//! page turns into, without filling or submitting anything.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use super::artifacts::{self, ArtifactSink};
use super::detector;
use super::invoker::{InvokeOutcome, Invoker};
use crate::browser::{DomProvider, Pattern, WindowHandle};
use crate::core::error::{tolerate, EngineError};

pub const CONTROL_POLLS: u32 = 30;
pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub id: String,
    pub placeholder: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ButtonInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormInfo {
    pub index: usize,
    pub action: String,
    pub method: String,
    pub inputs: Vec<InputInfo>,
    pub buttons: Vec<ButtonInfo>,
}

async fn attr<D: DomProvider + ?Sized>(
    dom: &mut D,
    c: &crate::browser::Control,
    name: &str,
) -> Result<Option<String>, EngineError> {
    Ok(tolerate("attribute", dom.attribute(c, name).await)?.flatten())
}

/// Describe every form in the current context.
pub async fn enumerate_forms<D: DomProvider + ?Sized>(dom: &mut D) -> Result<Vec<FormInfo>, EngineError> {
    let forms = tolerate("forms", dom.query(&Pattern::tags(&["form"])).await)?.unwrap_or_default();
    let mut out = Vec::with_capacity(forms.len());
    for (index, form) in forms.iter().enumerate() {
        let mut info = FormInfo {
            index,
            action: attr(dom, form, "action").await?.unwrap_or_default(),
            method: attr(dom, form, "method")
                .await?
                .unwrap_or_else(|| "get".into())
                .to_lowercase(),
            ..FormInfo::default()
        };

        let inputs = tolerate(
            "form inputs",
            dom.query_within(form, &Pattern::tags(&["input", "select", "textarea"])).await,
        )?
        .unwrap_or_default();
        for c in inputs {
            info.inputs.push(InputInfo {
                kind: attr(dom, &c, "type").await?.unwrap_or_default(),
                name: attr(dom, &c, "name").await?.unwrap_or_default(),
                id: attr(dom, &c, "id").await?.unwrap_or_default(),
                placeholder: attr(dom, &c, "placeholder").await?.unwrap_or_default(),
                required: attr(dom, &c, "required").await?.is_some(),
                tag: c.tag,
            });
        }

        let buttons = tolerate(
            "form buttons",
            dom.query_within(
                form,
                &Pattern::tags(&["button", "input"]).input_types(&["submit", "button"]),
            )
            .await,
        )?
        .unwrap_or_default();
        for c in buttons {
            info.buttons.push(ButtonInfo {
                kind: attr(dom, &c, "type").await?.unwrap_or_default(),
                name: attr(dom, &c, "name").await?.unwrap_or_default(),
                text: c.text.clone(),
                tag: c.tag,
            });
        }
        out.push(info);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeSnapshot {
    pub stage: String,
    pub url: String,
    pub forms: Vec<FormInfo>,
    pub window_handles: Vec<WindowHandle>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alert_texts: Vec<String>,
}

/// Capture `<base>.html/.png/.json` for the current page.
pub async fn capture_stage<D: DomProvider + ?Sized>(
    dom: &mut D,
    sink: &dyn ArtifactSink,
    base: &str,
    stage: &str,
    alert_texts: Vec<String>,
) -> Result<ProbeSnapshot, EngineError> {
    let snap = ProbeSnapshot {
        stage: stage.to_string(),
        url: tolerate("current_url", dom.current_url().await)?.unwrap_or_default(),
        forms: enumerate_forms(dom).await?,
        window_handles: tolerate("list_windows", dom.list_windows().await)?.unwrap_or_default(),
        alert_texts,
    };
    artifacts::snapshot(dom, sink, base).await?;
    match serde_json::to_value(&snap) {
        Ok(v) => artifacts::write_json_best_effort(sink, &format!("{base}.json"), &v).await,
        Err(e) => warn!("probe: snapshot not serialisable: {}", e),
    }
    Ok(snap)
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub pre: ProbeSnapshot,
    pub post: Option<ProbeSnapshot>,
    pub clicked: bool,
    pub outcome: String,
}

/// Open `target`, snapshot, click the apply control when it shows up within
/// the poll budget, snapshot again. Artifact names start with `probe_<stamp>`.
pub async fn probe_flow<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    sink: &dyn ArtifactSink,
    target: &str,
    stamp: &str,
    dialog_timeout: Duration,
) -> Result<ProbeReport, EngineError> {
    tolerate("navigate", dom.navigate(target).await)?;
    let base = format!("probe_{stamp}");
    let pre = capture_stage(dom, sink, &format!("{base}_pre"), "pre", Vec::new()).await?;

    let mut control = None;
    for _ in 0..CONTROL_POLLS {
        if let Some((_, c)) = detector::find_apply_control(dom).await? {
            control = Some(c);
            break;
        }
        inv.pacer().pause(CONTROL_POLL_INTERVAL).await?;
    }
    let Some(control) = control else {
        info!("probe: no apply control on {}", target);
        return Ok(ProbeReport {
            pre,
            post: None,
            clicked: false,
            outcome: "no_control".into(),
        });
    };

    let outcome = inv.invoke_action(dom, control).await?;
    let (alerts, label) = match &outcome {
        InvokeOutcome::Proceeded(r) => (r.dialog.iter().cloned().collect(), "proceeded"),
        InvokeOutcome::RateLimited(m) => (vec![m.clone()], "rate_limited"),
        InvokeOutcome::Challenge => (Vec::new(), "challenge"),
        InvokeOutcome::ClickFailed(_) => (Vec::new(), "click_failed"),
    };
    let mut alerts: Vec<String> = alerts;
    if let Some(late) = inv.accept_dialog(dom, dialog_timeout).await? {
        alerts.push(late);
    }
    let post = capture_stage(dom, sink, &format!("{base}_post"), "post", alerts).await?;
    info!("probe: {} -> {} ({} form(s))", target, post.url, post.forms.len());
    Ok(ProbeReport {
        pre,
        post: Some(post),
        clicked: !matches!(outcome, InvokeOutcome::ClickFailed(_)),
        outcome: label.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{button, input, Document, Effect, Element, MemoryDom};
    use crate::core::config::TimingConfig;
    use crate::engine::clock::{ManualClock, Pacer};
    use crate::features::artifacts::MemoryArtifacts;
    use chrono::NaiveDate;
    use std::sync::Arc;

    const VIEW: &str = "https://example.test/parent/Appchild_view.asp?sn=108";
    const FORM: &str = "https://example.test/parent/Appchild_regist.asp?sn=108";

    fn pacer() -> (Arc<ManualClock>, Pacer) {
        let t0 = NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        (clock.clone(), Pacer::unattended(clock))
    }

    fn apply_form() -> Document {
        Document::new([Element::new("form")
            .attr("action", "Appchild_regist_ok.asp")
            .attr("method", "POST")
            .children([
                input("text", "child_name").id("cname").attr("placeholder", "자녀 이름").required(),
                input("checkbox", "agree"),
                Element::new("input").attr("type", "submit").value("신청"),
            ])])
    }

    #[tokio::test]
    async fn enumerates_inputs_and_buttons() {
        let mut dom = MemoryDom::new().page(FORM, apply_form());
        dom.navigate(FORM).await.unwrap();
        let forms = enumerate_forms(&mut dom).await.unwrap();
        assert_eq!(forms.len(), 1);
        let f = &forms[0];
        assert_eq!(f.method, "post");
        assert_eq!(f.inputs.len(), 3);
        assert_eq!(f.inputs[0].name, "child_name");
        assert!(f.inputs[0].required);
        assert_eq!(f.buttons.len(), 1);
        assert_eq!(f.buttons[0].text, "신청");
    }

    #[tokio::test]
    async fn probe_records_pre_and_post_without_filling() {
        let mut dom = MemoryDom::new()
            .page(
                VIEW,
                Document::new([Element::new("div").class("btn-grp").child(
                    button("신청")
                        .on_invoke(Effect::Dialog("신청 페이지로 이동합니다".into()))
                        .on_invoke(Effect::Navigate(FORM.into())),
                )]),
            )
            .page(FORM, apply_form());
        let (_, pacer) = pacer();
        let timing = TimingConfig::default();
        let inv = Invoker::new(&timing, &pacer);
        let sink = MemoryArtifacts::new();
        let report = probe_flow(&mut dom, &inv, &sink, VIEW, "20250819_100000", Duration::from_secs(2))
            .await
            .unwrap();

        assert!(report.clicked);
        assert_eq!(report.outcome, "proceeded");
        assert!(report.pre.forms.is_empty());
        let post = report.post.unwrap();
        assert_eq!(post.url, FORM);
        assert_eq!(post.forms.len(), 1);
        assert_eq!(post.alert_texts, vec!["신청 페이지로 이동합니다".to_string()]);
        assert!(dom.writes().is_empty());
        for name in [
            "probe_20250819_100000_pre.html",
            "probe_20250819_100000_post.png",
        ] {
            assert!(sink.has_file(name), "{name}");
        }
        assert_eq!(
            sink.json("probe_20250819_100000_post.json").unwrap()["stage"],
            "post"
        );
    }

    #[tokio::test]
    async fn missing_control_gives_up_after_the_poll_budget() {
        let mut dom = MemoryDom::new().page(VIEW, Document::new([button("신청예정")]));
        let (clock, pacer) = pacer();
        let timing = TimingConfig::default();
        let inv = Invoker::new(&timing, &pacer);
        let sink = MemoryArtifacts::new();
        let report = probe_flow(&mut dom, &inv, &sink, VIEW, "x", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!report.clicked);
        assert_eq!(report.outcome, "no_control");
        assert_eq!(clock.sleeps().len(), CONTROL_POLLS as usize);
    }
}
