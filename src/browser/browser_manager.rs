//! Browser discovery and launch for the Chromium provider.

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Browser;
use futures::StreamExt;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::BrowserSettings;

/// Binary names looked up on `PATH`, most preferred first.
const PATH_NAMES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "brave-browser",
];

#[cfg(target_os = "linux")]
const INSTALL_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

#[cfg(target_os = "macos")]
const INSTALL_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

#[cfg(target_os = "windows")]
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
];

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const INSTALL_PATHS: &[&str] = &[];

/// First of [`PATH_NAMES`] that resolves to an executable in `path_var`.
fn on_path(path_var: &OsStr) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    PATH_NAMES
        .iter()
        .find_map(|n| which::which_in(n, Some(path_var), &cwd).ok())
}

/// Configured executable, then `PATH`, then well-known install locations.
pub fn find_chrome_executable(settings: &BrowserSettings) -> Option<String> {
    if let Some(p) = settings.resolve_executable() {
        return Some(p);
    }
    if let Some(p) = std::env::var_os("PATH").as_deref().and_then(on_path) {
        return Some(p.to_string_lossy().into_owned());
    }
    INSTALL_PATHS
        .iter()
        .find(|p| Path::new(p).exists())
        .map(|p| p.to_string())
}

/// Launch flags for one acquisition session. Popup blocking is off because
/// the same-tab policy keeps popups in the current tab.
pub fn launch_args(settings: &BrowserSettings) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-popup-blocking",
        "--disable-blink-features=AutomationControlled",
    ]
    .iter()
    .map(|a| a.to_string())
    .collect();
    if !settings.user_agent.trim().is_empty() {
        args.push(format!("--user-agent={}", settings.user_agent.trim()));
    }
    args
}

pub fn build_browser_config(exe: &str, settings: &BrowserSettings) -> Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: settings.width,
            height: settings.height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(settings.width, settings.height);
    for arg in launch_args(settings) {
        builder = builder.arg(arg);
    }
    if !settings.headless {
        builder = builder.with_head();
    }
    builder
        .build()
        .map_err(|e| anyhow!("invalid browser config: {}", e))
}

/// Major version from a `.../Chrome/127.0.6533.88 ...` product or user agent.
pub fn chrome_major(s: &str) -> Option<u32> {
    let (_, rest) = s.split_once("Chrome/")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `(browser, user agent)` majors when they disagree.
pub fn version_mismatch(product: &str, user_agent: &str) -> Option<(u32, u32)> {
    let browser = chrome_major(product)?;
    let claimed = chrome_major(user_agent)?;
    (browser != claimed).then_some((browser, claimed))
}

async fn log_version(browser: &Browser, settings: &BrowserSettings) {
    match browser.version().await {
        Ok(v) => {
            info!(
                "browser: {} (CDP protocol {}, V8 {})",
                v.product, v.protocol_version, v.js_version
            );
            if let Some((real, claimed)) = version_mismatch(&v.product, &settings.user_agent) {
                warn!(
                    "browser: major version {} does not match the configured user agent (Chrome/{})",
                    real, claimed
                );
            }
        }
        Err(e) => warn!("browser: version query failed: {}", e),
    }
}

/// A launched browser plus the task pumping its CDP handler.
pub struct LaunchedBrowser {
    pub browser: Browser,
    pub handler_task: JoinHandle<()>,
}

pub async fn launch_browser(settings: &BrowserSettings) -> Result<LaunchedBrowser> {
    let exe = find_chrome_executable(settings).ok_or_else(|| {
        anyhow!("no Chromium-family browser found; set browser.executable or CHROME_EXECUTABLE")
    })?;
    info!(
        "browser: launching {} (headless={}, {}x{})",
        exe, settings.headless, settings.width, settings.height
    );

    let config = build_browser_config(&exe, settings)?;
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("launching {} failed: {}", exe, e))?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("browser: CDP handler error: {}", e);
            }
        }
    });
    log_version(&browser, settings).await;

    Ok(LaunchedBrowser {
        browser,
        handler_task,
    })
}
