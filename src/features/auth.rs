//! Session authentication.
//!
//! Login happens once per browser session, before the schedule starts. A
//! failed login is fatal: polling an anonymous session only wastes the window.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::invoker::{ClickResult, Invoker};
use crate::browser::{DomProvider, Pattern};
use crate::core::config::{Credentials, EngineConfig};
use crate::core::error::{tolerate, EngineError};

pub const LOGIN_DIALOG_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOGIN_SETTLE_TIMEOUT: Duration = Duration::from_secs(20);
pub const LOGIN_POLL: Duration = Duration::from_millis(500);
pub const LOGIN_BUTTON_WORDS: &[&str] = &["로그인", "login", "log in"];

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, dom: &mut dyn DomProvider, inv: &Invoker<'_>) -> Result<(), EngineError>;
}

/// Username/password form login.
#[derive(Clone)]
pub struct FormLogin {
    login_url: String,
    username: String,
    password: String,
    username_field: String,
    password_field: String,
}

impl std::fmt::Debug for FormLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormLogin")
            .field("login_url", &self.login_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl FormLogin {
    /// Build from the configured login URL and credentials. Missing
    /// credentials are an authentication failure, not a silent skip.
    pub fn from_config(login_url: &str, creds: &Credentials) -> Result<Self, EngineError> {
        let username = creds
            .resolve_username()
            .ok_or_else(|| EngineError::Authentication("username is not configured".into()))?;
        let password = creds
            .resolve_password()
            .ok_or_else(|| EngineError::Authentication("password is not configured".into()))?;
        Ok(Self {
            login_url: login_url.to_string(),
            username,
            password,
            username_field: creds.username_field.clone(),
            password_field: creds.password_field.clone(),
        })
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    async fn field(
        &self,
        dom: &mut dyn DomProvider,
        key: &str,
    ) -> Result<Option<crate::browser::Control>, EngineError> {
        for attr in ["name", "id"] {
            let pattern = Pattern::tags(&["input"]).attr_contains(attr, key);
            let found = tolerate("login field", dom.query(&pattern).await)?.unwrap_or_default();
            for c in found {
                let value = tolerate("attribute", dom.attribute(&c, attr).await)?.flatten();
                if value.as_deref() == Some(key) {
                    return Ok(Some(c));
                }
            }
        }
        Ok(None)
    }

    /// Second submit input when there are several (the first is usually a
    /// search box), else the only one, else a button with login wording.
    async fn click_login(&self, dom: &mut dyn DomProvider, inv: &Invoker<'_>) -> Result<bool, EngineError> {
        let submits = tolerate(
            "submit inputs",
            dom.query(&Pattern::tags(&["input"]).input_types(&["submit"])).await,
        )?
        .unwrap_or_default();
        let pick = match submits.len() {
            0 => None,
            1 => submits.first().cloned(),
            _ => submits.get(1).cloned(),
        };
        let pick = match pick {
            Some(p) => Some(p),
            None => {
                let buttons = tolerate("buttons", dom.query(&Pattern::tags(&["button", "a"])).await)?
                    .unwrap_or_default();
                buttons.into_iter().find(|b| {
                    let t = b.text.to_lowercase();
                    LOGIN_BUTTON_WORDS.iter().any(|w| t.contains(w))
                })
            }
        };
        let Some(control) = pick else {
            return Ok(false);
        };
        Ok(inv.safe_click(dom, &control).await? == ClickResult::Clicked)
    }
}

#[async_trait]
impl Authenticator for FormLogin {
    async fn login(&self, dom: &mut dyn DomProvider, inv: &Invoker<'_>) -> Result<(), EngineError> {
        info!("auth: logging in at {}", self.login_url);
        tolerate("navigate", dom.navigate(&self.login_url).await)?
            .ok_or_else(|| EngineError::Authentication("login page did not load".into()))?;
        let start_url = tolerate("current_url", dom.current_url().await)?.unwrap_or_default();

        let user = self.field(dom, &self.username_field).await?.ok_or_else(|| {
            EngineError::Authentication(format!("no {:?} field on the login page", self.username_field))
        })?;
        let pass = self.field(dom, &self.password_field).await?.ok_or_else(|| {
            EngineError::Authentication(format!("no {:?} field on the login page", self.password_field))
        })?;
        dom.set_value(&user, &self.username).await?;
        dom.set_value(&pass, &self.password).await?;

        if !self.click_login(dom, inv).await? {
            return Err(EngineError::Authentication("no login control".into()));
        }
        if let Some(msg) = inv.accept_dialog(dom, LOGIN_DIALOG_TIMEOUT).await? {
            warn!("auth: dialog after login: {}", msg);
        }

        let deadline = inv.pacer().now()
            + chrono::Duration::from_std(LOGIN_SETTLE_TIMEOUT).unwrap_or(chrono::Duration::zero());
        loop {
            let url = tolerate("current_url", dom.current_url().await)?.unwrap_or_default();
            if !url.is_empty() && url != start_url {
                info!("auth: logged in as {}", self.username);
                return Ok(());
            }
            if inv.pacer().now() >= deadline {
                return Err(EngineError::Authentication(
                    "still on the login page after submitting credentials".into(),
                ));
            }
            inv.pacer().pause(LOGIN_POLL).await?;
        }
    }
}

/// One-shot login for the diagnostic tools. `false` when no login page is
/// configured.
pub async fn login_if_configured(
    cfg: &EngineConfig,
    dom: &mut dyn DomProvider,
    inv: &Invoker<'_>,
) -> Result<bool, EngineError> {
    let Some(url) = cfg.login_url.as_deref() else {
        return Ok(false);
    };
    FormLogin::from_config(url, &cfg.credentials)?.login(dom, inv).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{input, Document, Element, MemoryDom};
    use crate::core::config::TimingConfig;
    use crate::engine::clock::{ManualClock, Pacer};
    use chrono::NaiveDate;
    use std::sync::Arc;

    const LOGIN: &str = "https://example.test/member/login.asp";
    const HOME: &str = "https://example.test/index.asp";

    fn creds() -> Credentials {
        Credentials {
            username: Some("parent01".into()),
            password: Some("pw-123".into()),
            ..Credentials::default()
        }
    }

    fn pacer() -> Pacer {
        let t0 = NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        Pacer::unattended(Arc::new(ManualClock::new(t0)))
    }

    fn login_page(action: &str) -> Document {
        Document::new([
            Element::new("form").name("search").children([
                input("text", "q"),
                Element::new("input").attr("type", "submit").value("검색"),
            ]),
            Element::new("form").name("login").attr("action", action).children([
                input("text", "userid"),
                input("password", "Pass"),
                Element::new("input").attr("type", "submit").value("로그인"),
            ]),
        ])
    }

    #[tokio::test]
    async fn fills_credentials_and_uses_the_second_submit() {
        let mut dom = MemoryDom::new()
            .page(LOGIN, login_page(HOME))
            .page(HOME, Document::text("환영합니다"));
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let auth = FormLogin::from_config(LOGIN, &creds()).unwrap();
        auth.login(&mut dom, &inv).await.unwrap();
        assert_eq!(dom.current_url().await.unwrap(), HOME);
        assert_eq!(
            dom.writes(),
            vec![
                ("userid".to_string(), "parent01".to_string()),
                ("Pass".to_string(), "pw-123".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn staying_on_the_login_page_is_fatal() {
        let mut dom = MemoryDom::new().page(LOGIN, login_page(LOGIN));
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let auth = FormLogin::from_config(LOGIN, &creds()).unwrap();
        let err = auth.login(&mut dom, &inv).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }

    #[tokio::test]
    async fn no_login_page_means_no_login() {
        let mut dom = MemoryDom::new();
        let (timing, pacer) = (TimingConfig::default(), pacer());
        let inv = Invoker::new(&timing, &pacer);
        let cfg = EngineConfig::default();
        assert!(!login_if_configured(&cfg, &mut dom, &inv).await.unwrap());
        assert!(dom.events().is_empty());
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let mut c = creds();
        c.username = None;
        assert!(matches!(
            FormLogin::from_config(LOGIN, &c),
            Err(EngineError::Authentication(_))
        ));
    }

    #[test]
    fn debug_output_hides_the_password() {
        let auth = FormLogin::from_config(LOGIN, &creds()).unwrap();
        assert!(!format!("{auth:?}").contains("pw-123"));
    }
}
