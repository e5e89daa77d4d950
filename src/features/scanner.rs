//! Open-item scanner: sweep listing pages (and a bounded number of their
//! detail pages) for any item whose apply control is already open.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::artifacts::{self, ArtifactSink};
use super::detector;
use super::invoker::{InvokeOutcome, Invoker};
use super::probe::{enumerate_forms, FormInfo};
use crate::browser::{Control, DomProvider, Pattern};
use crate::core::error::{tolerate, EngineError};

pub const MAX_DETAIL_LINKS: usize = 30;

/// Listing pages swept when none are given, relative to the site root.
pub const LISTING_PATHS: &[&str] = &[
    "/parent/Appchild.asp",
    "/parent/AppParent.asp",
    "/guide/appPlayroom.asp",
    "/guide/appPlayroom2.asp",
    "/guide/appCulture.asp?Play_area=A",
    "/guide/appCulture.asp?Play_area=B",
    "/rainbow/AppRainbow.asp?Play_area=A&Code=1",
    "/rainbow/AppRainbow.asp?Play_area=A&Code=2",
    "/rainbow/AppRainbow.asp?Play_area=A&Code=3",
    "/parent/time_list.asp",
];

/// [`LISTING_PATHS`] resolved against `base`. Unjoinable paths are skipped.
pub fn default_listings(base: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base) else {
        return Vec::new();
    };
    LISTING_PATHS
        .iter()
        .filter_map(|p| base.join(p).ok())
        .map(|u| u.to_string())
        .collect()
}

fn detail_page_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(appchild_view|appparent_view|apprainbow_view|view)\.asp")
            .expect("detail page regex")
    })
}

fn detail_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&](sn|SN|id)=").expect("detail id regex"))
}

/// Whether `href` (already absolute) points at an item detail page on `host`.
pub fn is_detail_link(href: &str, host: &str) -> bool {
    let Ok(u) = Url::parse(href) else {
        return false;
    };
    u.host_str() == Some(host) && detail_page_re().is_match(u.path()) && detail_id_re().is_match(href)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub found: bool,
    pub listing_url: Option<String>,
    pub detail_url: Option<String>,
    pub apply_text: Option<String>,
    pub apply_href: Option<String>,
    pub apply_onclick: Option<String>,
    pub alerts: Vec<String>,
    pub after_url: Option<String>,
    pub forms: Vec<FormInfo>,
    pub artifacts: Vec<String>,
    pub attempted_details: Vec<String>,
    pub tried_detail_count: usize,
}

async fn detail_links<D: DomProvider + ?Sized>(dom: &mut D, base: &str) -> Result<Vec<String>, EngineError> {
    let Ok(base_url) = Url::parse(base) else {
        return Ok(Vec::new());
    };
    let host = base_url.host_str().unwrap_or_default().to_string();
    let anchors = tolerate("anchors", dom.query(&Pattern::tags(&["a"])).await)?.unwrap_or_default();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for a in anchors {
        let Some(href) = tolerate("attribute", dom.attribute(&a, "href").await)?.flatten() else {
            continue;
        };
        let Ok(abs) = base_url.join(href.trim()) else {
            continue;
        };
        let abs = abs.to_string();
        if is_detail_link(&abs, &host) && seen.insert(abs.clone()) {
            out.push(abs);
            if out.len() >= MAX_DETAIL_LINKS {
                break;
            }
        }
    }
    Ok(out)
}

/// Click an open control, follow it and record what it leads to.
async fn capture_open<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    sink: &dyn ArtifactSink,
    control: Control,
    summary: &mut ScanSummary,
    stamp: &str,
    dialog_timeout: Duration,
) -> Result<(), EngineError> {
    summary.found = true;
    summary.apply_text = Some(control.text.clone());
    summary.apply_href = tolerate("attribute", dom.attribute(&control, "href").await)?.flatten();
    summary.apply_onclick = tolerate("attribute", dom.attribute(&control, "onclick").await)?.flatten();

    match inv.invoke_action(dom, control).await? {
        InvokeOutcome::Proceeded(r) => summary.alerts.extend(r.dialog),
        InvokeOutcome::RateLimited(m) => summary.alerts.push(m),
        InvokeOutcome::Challenge => summary.alerts.push("challenge present".into()),
        InvokeOutcome::ClickFailed(reason) => debug!("scanner: click failed: {}", reason),
    }
    if let Some(late) = inv.accept_dialog(dom, dialog_timeout).await? {
        summary.alerts.push(late);
    }
    summary.after_url = tolerate("current_url", dom.current_url().await)?;
    summary.forms = enumerate_forms(dom).await?;

    let base = format!("open_scan_{stamp}");
    artifacts::snapshot(dom, sink, &base).await?;
    summary.artifacts = vec![format!("{base}.png"), format!("{base}.html")];
    Ok(())
}

/// Sweep `listings` in order and stop at the first open item.
pub async fn scan_listings<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    sink: &dyn ArtifactSink,
    listings: &[String],
    stamp: &str,
    dialog_timeout: Duration,
) -> Result<ScanSummary, EngineError> {
    let mut summary = ScanSummary::default();
    for listing in listings {
        inv.pacer().check()?;
        info!("scanner: listing {}", listing);
        if tolerate("navigate", dom.navigate(listing).await)?.is_none() {
            continue;
        }
        if let Some((_, control)) = detector::find_apply_control(dom).await? {
            summary.listing_url = Some(listing.clone());
            capture_open(dom, inv, sink, control, &mut summary, stamp, dialog_timeout).await?;
            return Ok(summary);
        }

        for detail in detail_links(dom, listing).await? {
            inv.pacer().check()?;
            summary.attempted_details.push(detail.clone());
            summary.tried_detail_count += 1;
            if tolerate("navigate", dom.navigate(&detail).await)?.is_none() {
                continue;
            }
            if let Some((_, control)) = detector::find_apply_control(dom).await? {
                info!("scanner: open item at {}", detail);
                summary.listing_url = Some(listing.clone());
                summary.detail_url = Some(detail.clone());
                capture_open(dom, inv, sink, control, &mut summary, stamp, dialog_timeout).await?;
                return Ok(summary);
            }
        }
    }
    info!(
        "scanner: nothing open across {} listing(s), {} detail page(s)",
        listings.len(),
        summary.tried_detail_count
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{button, link, Document, Effect, Element, MemoryDom};
    use crate::core::config::TimingConfig;
    use crate::engine::clock::{ManualClock, Pacer};
    use crate::features::artifacts::MemoryArtifacts;
    use chrono::NaiveDate;
    use std::sync::Arc;

    const LIST: &str = "https://example.test/parent/Appchild_list.asp";

    fn pacer() -> Pacer {
        let t0 = NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        Pacer::unattended(Arc::new(ManualClock::new(t0)))
    }

    #[test]
    fn detail_link_filter() {
        let host = "example.test";
        assert!(is_detail_link("https://example.test/parent/Appchild_view.asp?sn=108", host));
        assert!(is_detail_link("https://example.test/board/view.asp?id=3", host));
        assert!(!is_detail_link("https://example.test/parent/Appchild_view.asp", host));
        assert!(!is_detail_link("https://other.test/parent/Appchild_view.asp?sn=1", host));
        assert!(!is_detail_link("https://example.test/parent/list.asp?sn=1", host));
    }

    #[test]
    fn default_listings_keep_their_queries() {
        let urls = default_listings("https://example.test/parent/Appchild_view.asp?sn=1");
        assert_eq!(urls.len(), LISTING_PATHS.len());
        assert_eq!(urls[0], "https://example.test/parent/Appchild.asp");
        assert_eq!(urls[4], "https://example.test/guide/appCulture.asp?Play_area=A");
        assert!(default_listings("not a url").is_empty());
    }

    #[tokio::test]
    async fn finds_open_item_on_a_detail_page() {
        let closed = "https://example.test/parent/Appchild_view.asp?sn=107";
        let open = "https://example.test/parent/Appchild_view.asp?sn=108";
        let form = "https://example.test/parent/Appchild_regist.asp?sn=108";
        let mut dom = MemoryDom::new()
            .page(
                LIST,
                Document::new([
                    link("여름 숲 체험", "Appchild_view.asp?sn=107"),
                    link("여름 숲 체험", "Appchild_view.asp?sn=107"),
                    link("가을 캠프", "Appchild_view.asp?sn=108"),
                    link("공지", "/notice/list.asp"),
                ]),
            )
            .page(closed, Document::new([button("마감")]))
            .page(
                open,
                Document::new([Element::new("div").class("btn-grp").child(
                    link("신청", "javascript:void(0)")
                        .attr("onclick", "goApply(108)")
                        .on_invoke(Effect::Navigate(form.into())),
                )]),
            )
            .page(form, Document::new([Element::new("form")]));
        let timing = TimingConfig::default();
        let pacer = pacer();
        let inv = Invoker::new(&timing, &pacer);
        let sink = MemoryArtifacts::new();
        let s = scan_listings(&mut dom, &inv, &sink, &[LIST.to_string()], "t", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(s.found);
        assert_eq!(s.detail_url.as_deref(), Some(open));
        assert_eq!(s.tried_detail_count, 2);
        assert_eq!(s.apply_onclick.as_deref(), Some("goApply(108)"));
        assert_eq!(s.after_url.as_deref(), Some(form));
        assert_eq!(s.forms.len(), 1);
        assert!(sink.has_file("open_scan_t.html"));
    }

    #[tokio::test]
    async fn nothing_open_reports_attempts() {
        let mut dom = MemoryDom::new().page(LIST, Document::text("등록된 프로그램이 없습니다"));
        let timing = TimingConfig::default();
        let pacer = pacer();
        let inv = Invoker::new(&timing, &pacer);
        let sink = MemoryArtifacts::new();
        let s = scan_listings(&mut dom, &inv, &sink, &[LIST.to_string()], "t", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!s.found);
        assert_eq!(s.tried_detail_count, 0);
        assert!(sink.file_names().is_empty());
    }
}
