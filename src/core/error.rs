use thiserror::Error;

/// Faults raised by a DOM provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("stale element reference")]
    Stale,

    #[error("click intercepted: {0}")]
    Intercepted(String),

    #[error("session disconnected: {0}")]
    Disconnected(String),

    #[error("script failed: {0}")]
    Script(String),

    #[error("provider operation unavailable: {0}")]
    Unavailable(String),
}

pub type DomResult<T> = Result<T, DomError>;

const DISCONNECT_TOKENS: &[&str] = &[
    "connection refused",
    "failed to establish",
    "chrome not reachable",
    "disconnected",
    "invalid session id",
    "cannot connect to chrome",
    "receiver is gone",
    "channel closed",
];

const STALE_TOKENS: &[&str] = &[
    "stale element reference",
    "no node with given id",
    "node is detached",
    "cannot find context with specified id",
    "execution context was destroyed",
];

const INTERCEPT_TOKENS: &[&str] = &["click intercepted", "not clickable", "other element would receive"];

/// True when `message` reads like a transport-level failure.
pub fn looks_disconnected(message: &str) -> bool {
    let lower = message.to_lowercase();
    DISCONNECT_TOKENS.iter().any(|t| lower.contains(t))
}

impl DomError {
    /// Sort a raw provider error message into the taxonomy.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if looks_disconnected(&lower) {
            DomError::Disconnected(message)
        } else if STALE_TOKENS.iter().any(|t| lower.contains(t)) {
            DomError::Stale
        } else if INTERCEPT_TOKENS.iter().any(|t| lower.contains(t)) {
            DomError::Intercepted(message)
        } else {
            DomError::Script(message)
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, DomError::Disconnected(_))
    }

    /// Stale and intercepted faults are retried locally.
    pub fn is_transient_ui(&self) -> bool {
        matches!(self, DomError::Stale | DomError::Intercepted(_))
    }
}

/// Errors that leave the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session disconnected: {0}")]
    Disconnect(String),

    #[error("session restarts exhausted after {restarts} restart(s): {last}")]
    RestartsExhausted { restarts: u32, last: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("cancelled by operator")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider fault: {0}")]
    Provider(DomError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, EngineError::Disconnect(_))
    }
}

impl From<DomError> for EngineError {
    fn from(err: DomError) -> Self {
        match err {
            DomError::Disconnected(msg) => EngineError::Disconnect(msg),
            other => EngineError::Provider(other),
        }
    }
}

/// Outcome classes the engine distinguishes while running. Only the first two
/// can end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Disconnect,
    Authentication,
    TransientUi,
    RateLimited,
    ChallengePresent,
    LocalTimeout,
    WindowTimeout,
    MappingGap,
}

impl Fault {
    /// Fatal to the whole process. A disconnect is fatal only once the restart
    /// budget is spent, which the runner decides.
    pub fn is_fatal(self) -> bool {
        matches!(self, Fault::Disconnect | Fault::Authentication)
    }
}

impl From<&DomError> for Fault {
    fn from(err: &DomError) -> Self {
        match err {
            DomError::Disconnected(_) => Fault::Disconnect,
            DomError::Stale | DomError::Intercepted(_) => Fault::TransientUi,
            DomError::Script(_) | DomError::Unavailable(_) => Fault::TransientUi,
        }
    }
}

/// Best-effort wrapper: a disconnect propagates, every other provider fault is
/// logged at debug level and becomes `None`.
pub fn tolerate<T>(what: &str, res: DomResult<T>) -> Result<Option<T>, EngineError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(DomError::Disconnected(msg)) => Err(EngineError::Disconnect(msg)),
        Err(e) => {
            tracing::debug!("{} tolerated: {}", what, e);
            Ok(None)
        }
    }
}
