//! Production browser engine: Chrome driven over CDP by `headless_chrome`.
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking
//! pool and is raced against a hard timeout. On timeout the tab is closed
//! to abort the stuck CDP call; the pool's next liveness probe then fails
//! and the instance is replaced.

use anyhow::anyhow;
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use serde_json::Value;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use ad_radar_common::{BrowserPoolConfig, ScrapeError, ScrapeResult};

use crate::browser_pool::{BrowserLauncher, BrowserSession};
use crate::launch_args::chrome_args;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

pub struct ChromeLauncher {
    binary: BinaryStatus,
}

impl ChromeLauncher {
    /// Create the launcher after a pre-flight check of the browser binary.
    pub fn new(config: &BrowserPoolConfig) -> Self {
        let binary = BinaryStatus::inspect(config.browser_path.as_deref());
        match (binary, config.browser_path.as_deref()) {
            (BinaryStatus::Ready, Some(path)) => {
                info!("Browser binary ready at '{}'", path.display());
            }
            (BinaryStatus::AutoDetect, _) => {
                info!("No AD_RADAR_BROWSER_PATH set, Chrome will be auto-detected");
            }
            (status, path) => {
                warn!(
                    "Browser binary check failed for {:?}: {}",
                    path,
                    status.launch_hint(config)
                );
            }
        }
        if !config.in_container && running_as_root() {
            warn!("Running as root with the Chrome sandbox enabled; launches will fail unless AD_RADAR_IN_CONTAINER=true");
        }
        Self { binary }
    }

    pub fn binary_status(&self) -> BinaryStatus {
        self.binary
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, config: &BrowserPoolConfig) -> ScrapeResult<Arc<dyn BrowserSession>> {
        let hint = self.binary.launch_hint(config);
        let config = config.clone();
        let handle = tokio::task::spawn_blocking(move || launch_blocking(&config));

        match handle.await {
            Ok(Ok(session)) => Ok(Arc::new(session)),
            Ok(Err(e)) => {
                error!("FATAL: Browser failed to launch: {}. Likely cause: {}", e, hint);
                Err(ScrapeError::BrowserLaunch(format!("{} ({})", e, hint)))
            }
            Err(e) => Err(ScrapeError::BrowserLaunch(format!("launch task failed: {}", e))),
        }
    }
}

/// What the pre-flight check found at the configured browser path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryStatus {
    /// No path configured; headless_chrome searches for an installed Chrome
    AutoDetect,
    Missing,
    NotExecutable,
    Ready,
}

impl BinaryStatus {
    pub fn inspect(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::AutoDetect;
        };
        match std::fs::metadata(path) {
            Err(_) => Self::Missing,
            Ok(metadata) if !is_executable(&metadata) => Self::NotExecutable,
            Ok(_) => Self::Ready,
        }
    }

    /// Most likely reason a launch fails given this status
    pub fn launch_hint(&self, config: &BrowserPoolConfig) -> &'static str {
        match self {
            Self::Missing => "AD_RADAR_BROWSER_PATH points at a file that does not exist",
            Self::NotExecutable => "AD_RADAR_BROWSER_PATH is not an executable file",
            Self::AutoDetect => "no installed Chrome or Chromium was found; set AD_RADAR_BROWSER_PATH",
            Self::Ready if !config.in_container && running_as_root() => {
                "Chrome refuses to run as root with its sandbox; set AD_RADAR_IN_CONTAINER=true"
            }
            Self::Ready => "the browser process exited early; check for missing shared libraries",
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.is_file()
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: getuid has no preconditions and cannot fail
    unsafe { libc::getuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

fn launch_blocking(config: &BrowserPoolConfig) -> anyhow::Result<ChromeSession> {
    let args = chrome_args(config);
    let os_args: Vec<&OsStr> = args.iter().map(OsStr::new).collect();

    let mut builder = LaunchOptions::default_builder();
    builder
        .headless(config.headless)
        .window_size(Some(config.viewport))
        // The default 30s idle timeout closes the websocket under pooled reuse
        .idle_browser_timeout(Duration::from_secs(3600))
        .args(os_args);
    if let Some(path) = &config.browser_path {
        info!("Using custom browser binary: {}", path.display());
        builder.path(Some(path.clone()));
    }
    let options = builder
        .build()
        .map_err(|e| anyhow!("Failed to build launch options: {}", e))?;

    let browser = Browser::new(options)?;
    let tab = browser.new_tab()?;
    tab.set_default_timeout(config.action_timeout);
    tab.set_user_agent(&config.user_agent, Some(ACCEPT_LANGUAGE), None)?;

    Ok(ChromeSession {
        browser: Mutex::new(Some(browser)),
        tab,
        navigation_timeout: config.navigation_timeout,
        action_timeout: config.action_timeout,
    })
}

/// One Chrome process with a single reusable tab.
pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
    navigation_timeout: Duration,
    action_timeout: Duration,
}

impl ChromeSession {
    async fn run_blocking<T, F>(
        &self,
        what: &'static str,
        timeout: Duration,
        f: F,
    ) -> ScrapeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let handle = tokio::task::spawn_blocking(move || f(tab));

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ScrapeError::Browser(format!("{} failed: {}", what, e))),
            Ok(Err(e)) => Err(ScrapeError::Browser(format!("{} task failed: {}", what, e))),
            Err(_) => {
                warn!("{} hard timeout after {:?} - closing tab to abort", what, timeout);
                let tab = Arc::clone(&self.tab);
                tokio::task::spawn_blocking(move || {
                    let _ = tab.close(false);
                });
                Err(ScrapeError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn probe(&self) -> bool {
        let result = self
            .run_blocking("probe", PROBE_TIMEOUT, |tab| {
                Ok(tab.evaluate("1 + 1", false)?.value)
            })
            .await;
        matches!(result, Ok(Some(value)) if value == Value::from(2))
    }

    async fn navigate(&self, url: &str) -> ScrapeResult<()> {
        let url = url.to_string();
        self.run_blocking("navigation", self.navigation_timeout, move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn content(&self) -> ScrapeResult<String> {
        self.run_blocking("get_content", self.action_timeout, |tab| tab.get_content())
            .await
    }

    async fn evaluate(&self, script: &str) -> ScrapeResult<Value> {
        let script = script.to_string();
        self.run_blocking("evaluate", self.action_timeout, move |tab| {
            Ok(tab.evaluate(&script, true)?.value.unwrap_or(Value::Null))
        })
        .await
    }

    async fn close(&self) {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let tab = Arc::clone(&self.tab);
        // Dropping the Browser kills the process; that can block briefly
        let closed = tokio::task::spawn_blocking(move || {
            let _ = tab.close(false);
            drop(browser);
        })
        .await;
        if let Err(e) = closed {
            debug!("Browser close task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[cfg(unix)]
    fn temp_binary(mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("ad-radar-chrome-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_unset_path_means_auto_detect() {
        assert_eq!(BinaryStatus::inspect(None), BinaryStatus::AutoDetect);
    }

    #[test]
    fn test_missing_binary() {
        let status = BinaryStatus::inspect(Some(Path::new("/nonexistent/ad-radar/chromium")));
        assert_eq!(status, BinaryStatus::Missing);
        assert!(status
            .launch_hint(&BrowserPoolConfig::default())
            .contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_bits_decide_readiness() {
        let plain = temp_binary(0o644);
        assert_eq!(BinaryStatus::inspect(Some(&plain)), BinaryStatus::NotExecutable);

        let runnable = temp_binary(0o755);
        assert_eq!(BinaryStatus::inspect(Some(&runnable)), BinaryStatus::Ready);

        // A directory is never a browser
        let dir = std::env::temp_dir();
        assert_eq!(BinaryStatus::inspect(Some(&dir)), BinaryStatus::NotExecutable);

        let _ = std::fs::remove_file(plain);
        let _ = std::fs::remove_file(runnable);
    }

    #[test]
    fn test_launcher_keeps_preflight_result() {
        let config = BrowserPoolConfig {
            browser_path: Some(PathBuf::from("/nonexistent/ad-radar/chromium")),
            ..BrowserPoolConfig::default()
        };
        let launcher = ChromeLauncher::new(&config);
        assert_eq!(launcher.binary_status(), BinaryStatus::Missing);
    }
}
