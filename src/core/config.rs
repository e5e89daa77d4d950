use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::EngineError;
use super::types::UserProfile;

// ---------------------------------------------------------------------------
// EngineConfig: file-based config loader (openslot.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const CONFIG_FILE_NAME: &str = "openslot.json";
pub const ENV_CONFIG_PATH: &str = "OPENSLOT_CONFIG";
pub const ENV_PASSWORD: &str = "OPENSLOT_PASSWORD";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// Timing knobs. Every duration the engine waits on is named here.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TimingConfig {
    /// How long before the target the fine phase starts. Default: 300.
    pub pre_window_lead_secs: u64,
    /// How long after the target the fine phase keeps polling. Default: 300.
    pub trailing_window_secs: u64,
    /// Fine-phase length when no target time is set. Default: 1800.
    pub no_target_horizon_secs: u64,
    /// Keep-warm refresh interval during the coarse wait. Default: 600.
    pub coarse_refresh_secs: u64,
    /// Base fine-phase refresh cadence. Default: 5000.
    pub fine_cadence_ms: u64,
    /// Symmetric jitter applied to the fine cadence. Default: 1000.
    pub fine_jitter_ms: u64,
    pub click_dialog_timeout_ms: u64,
    pub probe_dialog_timeout_ms: u64,
    pub submit_dialog_timeout_ms: u64,
    pub new_window_timeout_ms: u64,
    /// Form-scan attempts after the action was invoked. Default: 3.
    pub followup_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pre_window_lead_secs: 300,
            trailing_window_secs: 300,
            no_target_horizon_secs: 1800,
            coarse_refresh_secs: 600,
            fine_cadence_ms: 5000,
            fine_jitter_ms: 1000,
            click_dialog_timeout_ms: 1000,
            probe_dialog_timeout_ms: 2000,
            submit_dialog_timeout_ms: 3000,
            new_window_timeout_ms: 2000,
            followup_attempts: 3,
        }
    }
}

impl TimingConfig {
    pub fn pre_window_lead(&self) -> Duration {
        Duration::from_secs(self.pre_window_lead_secs)
    }
    pub fn trailing_window(&self) -> Duration {
        Duration::from_secs(self.trailing_window_secs)
    }
    pub fn no_target_horizon(&self) -> Duration {
        Duration::from_secs(self.no_target_horizon_secs)
    }
    pub fn coarse_refresh(&self) -> Duration {
        Duration::from_secs(self.coarse_refresh_secs)
    }
    pub fn fine_cadence(&self) -> Duration {
        Duration::from_millis(self.fine_cadence_ms)
    }
    pub fn fine_jitter(&self) -> Duration {
        Duration::from_millis(self.fine_jitter_ms)
    }
    pub fn click_dialog_timeout(&self) -> Duration {
        Duration::from_millis(self.click_dialog_timeout_ms)
    }
    pub fn probe_dialog_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_dialog_timeout_ms)
    }
    pub fn submit_dialog_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_dialog_timeout_ms)
    }
    pub fn new_window_timeout(&self) -> Duration {
        Duration::from_millis(self.new_window_timeout_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BackoffConfig {
    /// First rate-limit sleep. Default: 12.
    pub base_secs: u64,
    /// Rate-limit sleeps never exceed this. Default: 60.
    pub ceiling_secs: u64,
    /// Sleep after a challenge widget is seen. Default: 30.
    pub challenge_secs: u64,
    /// Session-level restarts on disconnect. Default: 2.
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 12,
            ceiling_secs: 60,
            challenge_secs: 30,
            max_restarts: 2,
            restart_delay_ms: 1000,
        }
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_secs(self.base_secs)
    }
    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }
    pub fn challenge(&self) -> Duration {
        Duration::from_secs(self.challenge_secs)
    }
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Credentials {
    pub username: Option<String>,
    /// Never logged.
    pub password: Option<String>,
    pub username_field: String,
    pub password_field: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            username_field: "userid".to_string(),
            password_field: "Pass".to_string(),
        }
    }
}

impl Credentials {
    /// Password: JSON field → `OPENSLOT_PASSWORD` env var → `None`.
    pub fn resolve_password(&self) -> Option<String> {
        if let Some(p) = &self.password {
            if !p.is_empty() {
                return Some(p.clone());
            }
        }
        std::env::var(ENV_PASSWORD).ok().filter(|v| !v.is_empty())
    }

    pub fn resolve_username(&self) -> Option<String> {
        self.username
            .as_ref()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
    }
}

/// How direct "apply" URLs are derived from the target URL.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DirectApplyConfig {
    /// Query parameters that carry the item identifier, first match wins.
    pub id_params: Vec<String>,
    /// Flags appended to the target URL's query string, in order.
    pub query_flags: Vec<String>,
    /// Path templates on the target host; `{id}` is replaced by the identifier.
    pub id_paths: Vec<String>,
}

impl Default for DirectApplyConfig {
    fn default() -> Self {
        Self {
            id_params: vec!["sn".to_string(), "SN".to_string()],
            query_flags: vec!["apply=1".to_string(), "mode=apply".to_string()],
            id_paths: vec!["/parent/Appchild_regist.asp?sn={id}".to_string()],
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Explicit browser binary. Falls back to `CHROME_EXECUTABLE`, then
    /// auto-discovery.
    pub executable: Option<String>,
    pub width: u32,
    pub height: u32,
    pub user_agent: String,
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            width: 1400,
            height: 900,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl BrowserSettings {
    /// Executable: JSON field → `CHROME_EXECUTABLE` env var → `None`.
    /// Only returns paths that exist.
    pub fn resolve_executable(&self) -> Option<String> {
        if let Some(p) = &self.executable {
            let p = p.trim();
            if !p.is_empty() && Path::new(p).exists() {
                return Some(p.to_string());
            }
        }
        let p = std::env::var(ENV_CHROME_EXECUTABLE).ok()?;
        let p = p.trim();
        if !p.is_empty() && Path::new(p).exists() {
            Some(p.to_string())
        } else {
            None
        }
    }
}

/// Top-level config loaded from `openslot.json`. Constructed once at startup
/// and passed by reference to every component.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EngineConfig {
    pub target_url: Option<String>,
    pub login_url: Option<String>,
    /// Secondary status view used for verification.
    pub status_url: Option<String>,
    /// Local wall-clock release time. `None` polls immediately.
    #[serde(deserialize_with = "deserialize_open_at")]
    pub open_at: Option<NaiveDateTime>,
    pub timing: TimingConfig,
    pub backoff: BackoffConfig,
    pub profile: UserProfile,
    pub credentials: Credentials,
    pub direct_apply: DirectApplyConfig,
    pub browser: BrowserSettings,
    pub artifacts_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_url: None,
            login_url: None,
            status_url: None,
            open_at: None,
            timing: TimingConfig::default(),
            backoff: BackoffConfig::default(),
            profile: UserProfile::default(),
            credentials: Credentials::default(),
            direct_apply: DirectApplyConfig::default(),
            browser: BrowserSettings::default(),
            artifacts_dir: PathBuf::from("logs"),
        }
    }
}

impl EngineConfig {
    pub fn from_json(contents: &str) -> Result<Self, EngineError> {
        serde_json::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let target = self
            .target_url
            .as_deref()
            .ok_or_else(|| EngineError::Config("target_url is required".into()))?;
        url::Url::parse(target)
            .map_err(|e| EngineError::Config(format!("target_url {target:?}: {e}")))?;
        for (name, value) in [("login_url", &self.login_url), ("status_url", &self.status_url)] {
            if let Some(v) = value {
                url::Url::parse(v)
                    .map_err(|e| EngineError::Config(format!("{name} {v:?}: {e}")))?;
            }
        }
        if self.timing.fine_cadence_ms == 0 {
            return Err(EngineError::Config("timing.fine_cadence_ms must be > 0".into()));
        }
        if self.timing.fine_jitter_ms >= self.timing.fine_cadence_ms {
            return Err(EngineError::Config(
                "timing.fine_jitter_ms must be smaller than timing.fine_cadence_ms".into(),
            ));
        }
        if self.timing.coarse_refresh_secs == 0 {
            return Err(EngineError::Config("timing.coarse_refresh_secs must be > 0".into()));
        }
        if self.backoff.base_secs == 0 || self.backoff.base_secs > self.backoff.ceiling_secs {
            return Err(EngineError::Config(
                "backoff.base_secs must be > 0 and <= backoff.ceiling_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Accepts `YYYY-MM-DDTHH:MM[:SS]` or the same with a space separator.
pub fn parse_open_at(raw: &str) -> Result<NaiveDateTime, EngineError> {
    let raw = raw.trim();
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S%.f",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    Err(EngineError::Config(format!("invalid open_at timestamp: {raw:?}")))
}

fn deserialize_open_at<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_open_at(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Candidate config paths, first found wins:
/// 1. `OPENSLOT_CONFIG` env var path
/// 2. `./openslot.json`
/// 3. `~/.openslot/openslot.json`
pub fn config_candidates() -> Vec<PathBuf> {
    let mut v = Vec::new();
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        if !env_path.trim().is_empty() {
            v.push(PathBuf::from(env_path));
        }
    }
    v.push(PathBuf::from(CONFIG_FILE_NAME));
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".openslot").join(CONFIG_FILE_NAME));
    }
    v
}

/// Load `openslot.json`.
///
/// An explicit path must exist. Otherwise the standard locations are tried and
/// a missing file yields `Ok(None)`. Parse errors are always fatal.
pub fn load_engine_config(explicit: Option<&Path>) -> Result<Option<EngineConfig>, EngineError> {
    if let Some(path) = explicit {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let cfg = EngineConfig::from_json(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("{} loaded from {}", CONFIG_FILE_NAME, path.display());
        return Ok(Some(cfg));
    }

    for path in config_candidates() {
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let cfg = EngineConfig::from_json(&contents)
                    .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
                tracing::info!("{} loaded from {}", CONFIG_FILE_NAME, path.display());
                return Ok(Some(cfg));
            }
            Err(_) => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProfileKey;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.timing.pre_window_lead(), Duration::from_secs(300));
        assert_eq!(cfg.timing.coarse_refresh(), Duration::from_secs(600));
        assert_eq!(cfg.timing.fine_cadence(), Duration::from_secs(5));
        assert_eq!(cfg.timing.fine_jitter(), Duration::from_secs(1));
        assert_eq!(cfg.backoff.base(), Duration::from_secs(12));
        assert_eq!(cfg.backoff.ceiling(), Duration::from_secs(60));
        assert_eq!(cfg.backoff.max_restarts, 2);
        assert_eq!(cfg.credentials.username_field, "userid");
        assert_eq!(cfg.direct_apply.query_flags, vec!["apply=1", "mode=apply"]);
        assert_eq!(cfg.artifacts_dir, PathBuf::from("logs"));
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_sections() {
        let cfg = EngineConfig::from_json(
            r#"{
                "target_url": "https://example.test/parent/view.asp?sn=108",
                "open_at": "2025-08-19T10:00:00",
                "timing": { "fine_cadence_ms": 4000 },
                "profile": { "name": "조상우", "child_name": "조하늘" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.timing.fine_cadence_ms, 4000);
        assert_eq!(cfg.timing.fine_jitter_ms, 1000);
        assert_eq!(
            cfg.open_at.unwrap().to_string(),
            "2025-08-19 10:00:00"
        );
        assert_eq!(cfg.profile.get(ProfileKey::ChildName), Some("조하늘"));
        cfg.validate().unwrap();
    }

    #[test]
    fn invalid_open_at_is_a_config_error() {
        let err = EngineConfig::from_json(r#"{"open_at": "tomorrow"}"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn validate_requires_target_and_sane_cadence() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.validate().is_err());
        cfg.target_url = Some("https://example.test/item?sn=1".into());
        cfg.validate().unwrap();
        cfg.timing.fine_jitter_ms = cfg.timing.fine_cadence_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn open_at_accepts_space_and_minute_precision() {
        assert!(parse_open_at("2025-08-19 10:00").is_ok());
        assert!(parse_open_at("2025-08-19T10:00:00.500").is_ok());
        assert!(parse_open_at("10:00").is_err());
    }

    #[test]
    fn explicit_path_is_loaded_and_parse_errors_are_fatal() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        write!(good, r#"{{"target_url":"https://example.test/"}}"#).unwrap();
        let cfg = load_engine_config(Some(good.path())).unwrap().unwrap();
        assert_eq!(cfg.target_url.as_deref(), Some("https://example.test/"));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "{{ not json").unwrap();
        assert!(load_engine_config(Some(bad.path())).is_err());

        let missing = Path::new("/definitely/not/here/openslot.json");
        assert!(load_engine_config(Some(missing)).is_err());
    }
}
