//! Direct apply URLs: reach the form without the apply control, by URL.

use tracing::{debug, info};
use url::Url;

use super::invoker::{visible_forms, Invoker};
use crate::browser::DomProvider;
use crate::core::config::DirectApplyConfig;
use crate::core::error::{tolerate, EngineError};

/// The item identifier carried by `url`, as `(param, value)`.
pub fn item_id(url: &str, params: &[String]) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    for p in params {
        if let Some((_, v)) = parsed.query_pairs().find(|(k, _)| k == p.as_str()) {
            let v = v.trim().to_string();
            if !v.is_empty() {
                return Some((p.clone(), v));
            }
        }
    }
    None
}

/// Append `flag` (`key=value`) to the query string, keeping what is there.
pub fn append_query(url: &str, flag: &str) -> String {
    match url.split_once('#') {
        Some((head, frag)) => format!("{}#{}", append_query(head, flag), frag),
        None if url.contains('?') => {
            if url.ends_with('?') || url.ends_with('&') {
                format!("{url}{flag}")
            } else {
                format!("{url}&{flag}")
            }
        }
        None => format!("{url}?{flag}"),
    }
}

/// Candidate URLs in try order: identifier path templates on the target host
/// first, then the target URL with each query flag appended.
pub fn candidate_urls(target: &str, cfg: &DirectApplyConfig) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let (Ok(base), Some((_, id))) = (Url::parse(target), item_id(target, &cfg.id_params)) {
        for tpl in &cfg.id_paths {
            if let Ok(u) = base.join(&tpl.replace("{id}", &id)) {
                out.push(u.to_string());
            }
        }
    }
    for flag in &cfg.query_flags {
        out.push(append_query(target, flag));
    }
    let mut seen = std::collections::HashSet::new();
    out.retain(|u| seen.insert(u.clone()));
    out
}

/// Visit each candidate until one exposes a form. The provider is left on
/// that page (inside the frame holding the form, if any) and its URL is
/// returned. Without a hit, the provider is left on the last candidate.
pub async fn probe_direct_urls<D: DomProvider + ?Sized>(
    dom: &mut D,
    inv: &Invoker<'_>,
    candidates: &[String],
    dialog_timeout: std::time::Duration,
) -> Result<Option<String>, EngineError> {
    for url in candidates {
        inv.pacer().check()?;
        debug!("direct_apply: trying {}", url);
        if tolerate("navigate", dom.navigate(url).await)?.is_none() {
            continue;
        }
        inv.settle_after_navigation(dom, dialog_timeout).await?;
        if !visible_forms(dom).await?.is_empty() {
            info!("direct_apply: form exposed at {}", url);
            return Ok(Some(url.clone()));
        }
    }
    Ok(None)
}
