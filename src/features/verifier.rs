//! Post-submission verification against the account's status page.
//!
//! Evidence is only ever corroborating: the identifier showing up in the page
//! source, or a table row mentioning the identifier or a profile name.

use serde::Serialize;
use tracing::info;

use super::artifacts::{self, ArtifactSink};
use crate::browser::{DomProvider, Pattern};
use crate::core::error::{tolerate, EngineError};
use crate::core::types::{ProfileKey, UserProfile};

pub const ROW_EXCERPT_CHARS: usize = 120;
pub const SUMMARY_FILE: &str = "verify_summary.json";
pub const SNAPSHOT_BASE: &str = "verify_mypage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyMatch {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifySummary {
    pub sn: Option<String>,
    pub found: bool,
    pub matches: Vec<VerifyMatch>,
}

/// The item the verifier looks for.
#[derive(Debug, Clone, Default)]
pub struct VerifyTarget<'a> {
    /// `(param, value)` identifier pair.
    pub item: Option<(&'a str, &'a str)>,
    pub profile: Option<&'a UserProfile>,
}

fn excerpt(text: &str) -> String {
    text.chars().take(ROW_EXCERPT_CHARS).collect()
}

/// Collect evidence from the current page.
pub async fn collect_matches<D: DomProvider + ?Sized>(
    dom: &mut D,
    target: &VerifyTarget<'_>,
) -> Result<Vec<VerifyMatch>, EngineError> {
    let mut matches = Vec::new();
    if let Some((param, id)) = target.item {
        let html = tolerate("page_source", dom.page_source().await)?.unwrap_or_default();
        let needle = format!("{param}={id}");
        if html.contains(&needle) {
            matches.push(VerifyMatch {
                kind: format!("{}_in_html", param.to_lowercase()),
                value: needle,
            });
        }
    }

    let names: Vec<(ProfileKey, &str)> = target
        .profile
        .map(|p| {
            [ProfileKey::Name, ProfileKey::ChildName]
                .into_iter()
                .filter_map(|k| p.get(k).map(|v| (k, v)))
                .collect()
        })
        .unwrap_or_default();

    let rows = tolerate("rows", dom.query(&Pattern::tags(&["tr"])).await)?.unwrap_or_default();
    for row in rows {
        let Some(text) = tolerate("row text", dom.visible_text(Some(&row)).await)? else {
            continue;
        };
        if let Some((param, id)) = target.item {
            if text.contains(id) {
                matches.push(VerifyMatch {
                    kind: format!("row_contains_{}", param.to_lowercase()),
                    value: excerpt(&text),
                });
            }
        }
        for (key, value) in &names {
            if text.contains(value) {
                matches.push(VerifyMatch {
                    kind: format!("row_contains_{}", key.as_str()),
                    value: excerpt(&text),
                });
            }
        }
    }
    Ok(matches)
}

/// Open the status page, look for evidence and record the summary. A status
/// page that cannot be opened verifies nothing.
pub async fn verify<D: DomProvider + ?Sized>(
    dom: &mut D,
    sink: &dyn ArtifactSink,
    status_url: &str,
    target: &VerifyTarget<'_>,
    now: chrono::NaiveDateTime,
) -> Result<VerifySummary, EngineError> {
    let opened = tolerate("navigate", dom.navigate(status_url).await)?.is_some();
    let matches = if opened {
        collect_matches(dom, target).await?
    } else {
        Vec::new()
    };
    artifacts::snapshot(dom, sink, SNAPSHOT_BASE).await?;

    let summary = VerifySummary {
        sn: target.item.map(|(_, id)| id.to_string()),
        found: !matches.is_empty(),
        matches,
    };
    match serde_json::to_value(&summary) {
        Ok(v) => artifacts::write_json_best_effort(sink, SUMMARY_FILE, &v).await,
        Err(e) => info!("verifier: summary not serialisable: {}", e),
    }
    artifacts::record_event(
        sink,
        now,
        &format!(
            "[verify] MyPage check: sn={}, found={}",
            summary.sn.as_deref().unwrap_or("-"),
            summary.found
        ),
    )
    .await;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{DomOp, Document, Element, MemoryDom};
    use crate::core::error::DomError;
    use crate::features::artifacts::MemoryArtifacts;
    use chrono::NaiveDate;

    const STATUS: &str = "https://example.test/mypage/apply_list.asp";

    fn now() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(10, 0, 9)
            .unwrap()
    }

    fn row(cells: &[&str]) -> Element {
        Element::new("tr").children(cells.iter().map(|c| Element::new("td").text(c)))
    }

    #[tokio::test]
    async fn finds_identifier_and_names_in_rows() {
        let long = "가".repeat(200);
        let mut dom = MemoryDom::new().page(
            STATUS,
            Document::new([
                Element::new("a").attr("href", "/parent/Appchild_view.asp?sn=108").text("보기"),
                Element::new("table").children([
                    row(&["108", "여름 숲 체험", "조하늘", "접수완료"]),
                    row(&["99", &long]),
                ]),
            ]),
        );
        let profile = UserProfile::from_pairs([("name", "조상우"), ("child_name", "조하늘")]);
        let sink = MemoryArtifacts::new();
        let target = VerifyTarget {
            item: Some(("sn", "108")),
            profile: Some(&profile),
        };
        let s = verify(&mut dom, &sink, STATUS, &target, now()).await.unwrap();

        assert!(s.found);
        let kinds: Vec<_> = s.matches.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, vec!["sn_in_html", "row_contains_sn", "row_contains_child_name"]);
        assert_eq!(s.matches[1].value, "108 여름 숲 체험 조하늘 접수완료");

        let json = sink.json(SUMMARY_FILE).unwrap();
        assert_eq!(json["sn"], "108");
        assert_eq!(json["matches"][0]["type"], "sn_in_html");
        assert!(sink.has_file("verify_mypage.html"));
        assert!(sink.has_file("verify_mypage.png"));
        assert!(sink.logged("[verify] MyPage check: sn=108, found=true"));
    }

    #[tokio::test]
    async fn row_excerpts_are_truncated() {
        let long = "나".repeat(300);
        let mut dom = MemoryDom::new().page(STATUS, Document::new([row(&["108", &long])]));
        let sink = MemoryArtifacts::new();
        let target = VerifyTarget {
            item: Some(("sn", "108")),
            profile: None,
        };
        let s = verify(&mut dom, &sink, STATUS, &target, now()).await.unwrap();
        assert_eq!(s.matches.len(), 1);
        assert_eq!(s.matches[0].value.chars().count(), ROW_EXCERPT_CHARS);
    }

    #[tokio::test]
    async fn unreachable_status_page_verifies_nothing() {
        let mut dom = MemoryDom::new();
        dom.fail_next(DomOp::Navigate, DomError::Script("net::ERR_NAME_NOT_RESOLVED".into()));
        let sink = MemoryArtifacts::new();
        let target = VerifyTarget {
            item: Some(("sn", "108")),
            profile: None,
        };
        let s = verify(&mut dom, &sink, STATUS, &target, now()).await.unwrap();
        assert!(!s.found);
        assert!(sink.logged("found=false"));
    }
}
