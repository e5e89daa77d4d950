//! Preflight mapper: guess the apply-handler paths of an item and fetch them
//! over plain HTTP with the browser session's cookies, before the window
//! opens.

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use chrono::NaiveDateTime;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::artifacts::{self, ArtifactSink};

pub const FOLDERS: &[&str] = &["parent", "mypage"];
pub const HANDLER_NAMES: &[&str] = &[
    "Appchild", "AppChild", "appchild", "ChildApply", "ApplyChild", "ChildApp", "ChildReg",
];
pub const HANDLER_SUFFIXES: &[&str] = &[
    "", "_write", "_apply", "_form", "_input", "_proc", "_ok", "_insert", "_reg", "_request",
    "_submit", "_join", "_regist", "_regist_ok", "Write", "Apply", "Form", "Input", "Proc", "Ok",
    "Insert", "Reg", "Request", "Submit", "Join", "Regist", "Regist_ok",
];
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Body words that make a response worth keeping.
pub const INTERESTING_WORDS: &[&str] = &["신청", "동의"];

/// Candidate handler paths for item `sn`, deduplicated in generation order:
/// every folder/name/suffix with the id, the same without it, then a few
/// known view/apply variants.
pub fn candidate_paths(sn: &str) -> Vec<String> {
    let mut out = Vec::new();
    for with_id in [true, false] {
        for folder in FOLDERS {
            for name in HANDLER_NAMES {
                for suffix in HANDLER_SUFFIXES {
                    let mut p = format!("/{folder}/{name}{suffix}.asp");
                    if with_id {
                        p.push_str(&format!("?sn={sn}"));
                    }
                    out.push(p);
                }
            }
        }
    }
    out.extend([
        format!("/parent/Appchild_view.asp?sn={sn}&mode=apply"),
        format!("/parent/Appchild_view.asp?apply=1&sn={sn}"),
        format!("/parent/apply.asp?sn={sn}"),
        format!("/parent/apply_ok.asp?sn={sn}"),
    ]);
    let mut seen = HashSet::new();
    out.retain(|p| seen.insert(p.clone()));
    out
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightResult {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_form: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub time: String,
    pub sn: String,
    pub results: Vec<PreflightResult>,
}

/// What a fetched body tells us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyFacts {
    pub has_form: bool,
    pub title: Option<String>,
    pub interesting: bool,
}

pub fn inspect_body(body: &str) -> BodyFacts {
    let doc = Html::parse_document(body);
    let has_form = Selector::parse("form")
        .map(|s| doc.select(&s).next().is_some())
        .unwrap_or(false);
    let title = Selector::parse("title").ok().and_then(|s| {
        doc.select(&s)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });
    BodyFacts {
        has_form,
        title,
        interesting: has_form || INTERESTING_WORDS.iter().any(|w| body.contains(w)),
    }
}

fn worth_saving(status: u16) -> bool {
    matches!(status, 200 | 302 | 303)
}

/// GET with the session cookie, retrying transport failures and 5xx.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    cookie: &str,
) -> anyhow::Result<(u16, String, String)> {
    let res = retry(
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(Duration::from_secs(6)))
            .build(),
        || async {
            let mut req = client.get(url).timeout(REQUEST_TIMEOUT);
            if !cookie.is_empty() {
                req = req.header(reqwest::header::COOKIE, cookie);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::anyhow!("{}", e)))?;
            let status = resp.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(anyhow::anyhow!("HTTP {}", status)));
            }
            let final_url = resp.url().to_string();
            let body = resp
                .text()
                .await
                .map_err(|e| backoff::Error::permanent(anyhow::anyhow!("{}", e)))?;
            Ok((status.as_u16(), final_url, body))
        },
    )
    .await?;
    Ok(res)
}

/// Fetch every candidate path under `base` and write
/// `preflight_map_<stamp>.json`. Interesting bodies are kept as
/// `preflight_<stamp>_<i>.html`.
pub async fn preflight_map(
    client: &reqwest::Client,
    sink: &dyn ArtifactSink,
    base: &str,
    sn: &str,
    cookie: &str,
    now: NaiveDateTime,
) -> anyhow::Result<PreflightReport> {
    let base = Url::parse(base)?;
    let stamp = now.format("%Y%m%d_%H%M%S").to_string();
    let paths = candidate_paths(sn);
    info!("preflight: {} candidate path(s) for sn={}", paths.len(), sn);

    let mut results = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        let url = match base.join(path) {
            Ok(u) => u.to_string(),
            Err(e) => {
                results.push(PreflightResult {
                    path: path.clone(),
                    error: Some(e.to_string()),
                    ..PreflightResult::default()
                });
                continue;
            }
        };
        match fetch(client, &url, cookie).await {
            Ok((status, final_url, body)) => {
                let facts = inspect_body(&body);
                let mut r = PreflightResult {
                    path: path.clone(),
                    status: Some(status),
                    final_url: Some(final_url),
                    len: Some(body.len()),
                    has_form: Some(facts.has_form),
                    title: facts.title,
                    ..PreflightResult::default()
                };
                if worth_saving(status) && facts.interesting {
                    let name = format!("preflight_{stamp}_{i}.html");
                    match sink.save_html(&name, &body).await {
                        Ok(()) => r.saved = Some(name),
                        Err(e) => warn!("preflight: saving {} failed: {}", name, e),
                    }
                }
                debug!("preflight: {} -> {}", path, status);
                results.push(r);
            }
            Err(e) => {
                debug!("preflight: {} failed: {}", path, e);
                results.push(PreflightResult {
                    path: path.clone(),
                    error: Some(e.to_string()),
                    ..PreflightResult::default()
                });
            }
        }
    }

    let report = PreflightReport {
        time: stamp.clone(),
        sn: sn.to_string(),
        results,
    };
    let value = serde_json::to_value(&report)?;
    artifacts::write_json_best_effort(sink, &format!("preflight_map_{stamp}.json"), &value).await;
    let hits = report.results.iter().filter(|r| r.has_form == Some(true)).count();
    info!("preflight: {} of {} path(s) expose a form", hits, report.results.len());
    Ok(report)
}
