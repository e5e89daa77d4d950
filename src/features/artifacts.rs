//! Where captures end up.
//!
//! The engine decides when to capture; an [`ArtifactSink`] decides how. Sinks
//! return `io::Result` and the engine treats every failure as non-fatal.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::browser::DomProvider;
use crate::core::error::{tolerate, EngineError};

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn save_screenshot(&self, name: &str, png: &[u8]) -> io::Result<()>;
    async fn save_html(&self, name: &str, html: &str) -> io::Result<()>;
    async fn write_json(&self, name: &str, value: &serde_json::Value) -> io::Result<()>;
    /// Append one already-formatted line to the event log.
    async fn append_event(&self, line: &str) -> io::Result<()>;
}

/// `[HH:MM:SS] message`.
pub fn event_line(at: NaiveDateTime, message: &str) -> String {
    format!("[{}] {}", at.format("%H:%M:%S"), message)
}

/// Append to the event log, logging (not propagating) sink failures.
pub async fn record_event(sink: &dyn ArtifactSink, at: NaiveDateTime, message: &str) {
    info!("{}", message);
    if let Err(e) = sink.append_event(&event_line(at, message)).await {
        warn!("artifacts: event log append failed: {}", e);
    }
}

pub async fn write_json_best_effort(sink: &dyn ArtifactSink, name: &str, value: &serde_json::Value) {
    if let Err(e) = sink.write_json(name, value).await {
        warn!("artifacts: writing {} failed: {}", name, e);
    }
}

/// Drain the session's network events into `har_<YYYYmmdd_HHMMSS>.jsonl`, one
/// event per line. Returns how many were written. Nothing is written for an
/// empty log.
pub async fn dump_network_log<D: DomProvider + ?Sized>(
    dom: &mut D,
    sink: &dyn ArtifactSink,
    at: NaiveDateTime,
) -> usize {
    let events = match dom.network_log().await {
        Ok(ev) => ev,
        Err(e) => {
            warn!("artifacts: network log unavailable: {}", e);
            return 0;
        }
    };
    if events.is_empty() {
        return 0;
    }
    let mut body = String::new();
    for ev in &events {
        match serde_json::to_string(ev) {
            Ok(line) => {
                body.push_str(&line);
                body.push('\n');
            }
            Err(e) => warn!("artifacts: skipping network event: {}", e),
        }
    }
    let name = format!("har_{}.jsonl", at.format("%Y%m%d_%H%M%S"));
    if let Err(e) = sink.save_html(&name, &body).await {
        warn!("artifacts: saving {} failed: {}", name, e);
        return 0;
    }
    info!("artifacts: {} network event(s) -> {}", events.len(), name);
    events.len()
}

/// Screenshot plus HTML of the current page as `<base>.png` / `<base>.html`.
/// Provider faults other than a disconnect are tolerated.
pub async fn snapshot<D: DomProvider + ?Sized>(
    dom: &mut D,
    sink: &dyn ArtifactSink,
    base: &str,
) -> Result<(), EngineError> {
    if let Some(html) = tolerate("page_source", dom.page_source().await)? {
        if let Err(e) = sink.save_html(&format!("{base}.html"), &html).await {
            warn!("artifacts: saving {}.html failed: {}", base, e);
        }
    }
    if let Some(png) = tolerate("screenshot", dom.screenshot().await)? {
        if let Err(e) = sink.save_screenshot(&format!("{base}.png"), &png).await {
            warn!("artifacts: saving {}.png failed: {}", base, e);
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// Filesystem
// ───────────────────────────────────────────────────────────────────────────

/// Writes everything under one directory. The event log is
/// `events_<YYYYmmdd_HHMMSS>.log`, named once per process.
#[derive(Debug, Clone)]
pub struct FileArtifacts {
    dir: PathBuf,
    event_log: PathBuf,
}

impl FileArtifacts {
    pub async fn create(dir: impl Into<PathBuf>, started: NaiveDateTime) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let event_log = dir.join(format!("events_{}.log", started.format("%Y%m%d_%H%M%S")));
        info!("artifacts: writing to {}", dir.display());
        Ok(Self { dir, event_log })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn event_log(&self) -> &Path {
        &self.event_log
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[async_trait]
impl ArtifactSink for FileArtifacts {
    async fn save_screenshot(&self, name: &str, png: &[u8]) -> io::Result<()> {
        tokio::fs::write(self.path(name), png).await
    }

    async fn save_html(&self, name: &str, html: &str) -> io::Result<()> {
        tokio::fs::write(self.path(name), html).await
    }

    async fn write_json(&self, name: &str, value: &serde_json::Value) -> io::Result<()> {
        let body = serde_json::to_string_pretty(value)?;
        tokio::fs::write(self.path(name), body).await
    }

    async fn append_event(&self, line: &str) -> io::Result<()> {
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.event_log)
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        f.flush().await
    }
}

// ───────────────────────────────────────────────────────────────────────────
// In memory
// ───────────────────────────────────────────────────────────────────────────

/// Keeps every capture in memory, for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifacts {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    json: Mutex<BTreeMap<String, serde_json::Value>>,
    events: Mutex<Vec<String>>,
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn html(&self, name: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn json(&self, name: &str) -> Option<serde_json::Value> {
        self.json
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether any event line contains `needle`.
    pub fn logged(&self, needle: &str) -> bool {
        self.events().iter().any(|l| l.contains(needle))
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifacts {
    async fn save_screenshot(&self, name: &str, png: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), png.to_vec());
        Ok(())
    }

    async fn save_html(&self, name: &str, html: &str) -> io::Result<()> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), html.as_bytes().to_vec());
        Ok(())
    }

    async fn write_json(&self, name: &str, value: &serde_json::Value) -> io::Result<()> {
        self.json
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn append_event(&self, line: &str) -> io::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{Document, MemoryDom};
    use crate::core::error::DomError;
    use crate::browser::memory::DomOp;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(9, 55, 7)
            .unwrap()
    }

    #[test]
    fn event_lines_carry_wall_clock() {
        assert_eq!(event_line(at(), "poll: started"), "[09:55:07] poll: started");
    }

    #[tokio::test]
    async fn file_sink_writes_under_its_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileArtifacts::create(tmp.path().join("logs"), at()).await.unwrap();
        sink.save_html("captcha_page.html", "<html></html>").await.unwrap();
        sink.write_json("verify_summary.json", &serde_json::json!({"found": true}))
            .await
            .unwrap();
        sink.append_event("[09:55:07] one").await.unwrap();
        sink.append_event("[09:55:08] two").await.unwrap();

        assert!(sink.dir().join("captcha_page.html").exists());
        let summary = std::fs::read_to_string(sink.dir().join("verify_summary.json")).unwrap();
        assert!(summary.contains("\"found\": true"));
        assert!(sink.event_log().ends_with("events_20250819_095507.log"));
        let log = std::fs::read_to_string(sink.event_log()).unwrap();
        assert_eq!(log, "[09:55:07] one\n[09:55:08] two\n");
    }

    #[tokio::test]
    async fn snapshot_tolerates_screenshot_failure() {
        let mut dom = MemoryDom::new().page("https://example.test/", Document::text("hello"));
        dom.navigate("https://example.test/").await.unwrap();
        dom.fail_next(DomOp::Screenshot, DomError::Script("no viewport".into()));
        let sink = MemoryArtifacts::new();
        snapshot(&mut dom, &sink, "captcha_page").await.unwrap();
        assert!(sink.html("captcha_page.html").unwrap().contains("hello"));
        assert!(!sink.has_file("captcha_page.png"));
    }

    #[tokio::test]
    async fn snapshot_propagates_disconnect() {
        let mut dom = MemoryDom::new();
        dom.fail_always(DomOp::PageSource, DomError::Disconnected("chrome not reachable".into()));
        let sink = MemoryArtifacts::new();
        let err = snapshot(&mut dom, &sink, "x").await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn network_log_is_written_as_json_lines() {
        let sink = MemoryArtifacts::new();
        let mut idle = MemoryDom::new();
        assert_eq!(dump_network_log(&mut idle, &sink, at()).await, 0);
        assert!(sink.file_names().is_empty());

        let mut dom = MemoryDom::new().page("https://example.test/", Document::text("hello"));
        dom.navigate("https://example.test/").await.unwrap();
        assert_eq!(dump_network_log(&mut dom, &sink, at()).await, 2);
        let body = sink.html("har_20250819_095507.jsonl").unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["method"], "Network.responseReceived");
        assert_eq!(lines[1]["status"], 200);
    }
}
