use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::config::EngineConfig;

/// Process-wide handles shared by the binaries: the immutable configuration,
/// the HTTP client used for preflight requests, and the operator abort switch.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub http_client: reqwest::Client,
    abort_tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("target_url", &self.config.target_url)
            .field("open_at", &self.config.open_at)
            .field("aborted", &*self.abort_tx.borrow())
            .finish()
    }
}

impl AppState {
    pub fn new(config: EngineConfig, http_client: reqwest::Client) -> Self {
        let (abort_tx, _abort_rx) = watch::channel(false);
        Self {
            config: Arc::new(config),
            http_client,
            abort_tx: Arc::new(abort_tx),
        }
    }

    /// Default client: gzip/brotli, bounded timeout, no cookie store (session
    /// cookies are copied from the browser per request).
    pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
    }

    pub fn abort_receiver(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    /// Flip the kill switch. Every pacer watching the channel wakes up and
    /// returns `Cancelled`.
    pub fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }
}
