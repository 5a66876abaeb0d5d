//! Configuration management with serde serialization/deserialization
//!
//! This module provides the service configuration, the request and response
//! shapes exchanged over HTTP, and the Chrome launch settings derived from
//! them.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// Device scale factor used for every capture.
pub const DEVICE_SCALE_FACTOR: f64 = 1.0;

/// Upper bound on `screenshot_retries` accepted from a request.
pub const MAX_SCREENSHOT_RETRIES: u32 = 10;

/// User agent applied when the caller does not supply one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome Safari";

/// Main configuration structure for the relay service
///
/// Controls admission limits, the page settling budget, fallback behaviour
/// and callback delivery. Every field has a default so a configuration file
/// only needs to name what it changes.
///
/// # Examples
///
/// ```rust
/// use webshot_relay::Config;
///
/// let config = Config {
///     max_concurrent_captures: 2,
///     viewport_fallback: false,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Socket address the HTTP server binds to (default: 127.0.0.1:8000)
    pub bind: String,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Maximum number of browser sessions alive at once (default: 4)
    ///
    /// Every capture launches its own browser process, so this bounds the
    /// memory a burst of requests can claim. Requests beyond the limit wait.
    pub max_concurrent_captures: usize,

    /// Quiet period with no in-flight requests that counts as network idle (default: 500ms)
    pub navigation_idle_window: Duration,

    /// Fixed pause after page preparation (default: 1s)
    pub settle_delay: Duration,

    /// Budget for the second network-idle wait after preparation (default: 5s)
    pub idle_recheck_timeout: Duration,

    /// Budget for image decode and font readiness (default: 8s)
    pub asset_wait_timeout: Duration,

    /// Capture the viewport only on the final retry of a full-page request (default: true)
    pub viewport_fallback: bool,

    /// Autoscroll tuning
    pub autoscroll: AutoscrollSettings,

    /// Callback delivery settings
    pub notify: NotifySettings,

    /// Additional Chrome command-line switches
    pub extra_chrome_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            chrome_path: None,
            max_concurrent_captures: 4,
            navigation_idle_window: Duration::from_millis(500),
            settle_delay: Duration::from_millis(1000),
            idle_recheck_timeout: Duration::from_secs(5),
            asset_wait_timeout: Duration::from_secs(8),
            viewport_fallback: true,
            autoscroll: AutoscrollSettings::default(),
            notify: NotifySettings::default(),
            extra_chrome_args: Vec::new(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file.
    pub async fn load(path: &Path) -> Result<Self, CaptureError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.max_concurrent_captures == 0 {
            return Err(CaptureError::ConfigurationError(
                "max_concurrent_captures must be greater than 0".to_string(),
            ));
        }

        if self.navigation_idle_window.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "navigation_idle_window must be greater than 0".to_string(),
            ));
        }

        if self.autoscroll.step_px == 0 || self.autoscroll.max_rounds == 0 {
            return Err(CaptureError::ConfigurationError(
                "autoscroll step_px and max_rounds must be greater than 0".to_string(),
            ));
        }

        if self.autoscroll.stable_rounds == 0 {
            return Err(CaptureError::ConfigurationError(
                "autoscroll stable_rounds must be greater than 0".to_string(),
            ));
        }

        if self.notify.timeout.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "notify timeout must be greater than 0".to_string(),
            ));
        }

        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(CaptureError::ConfigurationError(format!(
                "invalid bind address: {}",
                self.bind
            )));
        }

        Ok(())
    }
}

/// Tuning for the autoscroll-until-settled pass
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoscrollSettings {
    /// Pixels scrolled per round (default: 800)
    pub step_px: u32,

    /// Hard cap on scroll rounds (default: 40)
    pub max_rounds: u32,

    /// Rounds without height growth that end the pass (default: 2)
    pub stable_rounds: u32,
}

impl Default for AutoscrollSettings {
    fn default() -> Self {
        Self {
            step_px: 800,
            max_rounds: 40,
            stable_rounds: 2,
        }
    }
}

/// Outbound callback settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Timeout for the single POST (default: 30s)
    pub timeout: Duration,

    /// Characters of the callback's response body kept in the outcome (default: 2000)
    pub max_response_chars: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_response_chars: 2000,
        }
    }
}

/// Viewport dimensions reported back with each capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1080,
        }
    }
}

/// Navigation-completion condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// Navigation committed, nothing else awaited
    Commit,
    /// `DOMContentLoaded` fired
    DomContentLoaded,
    /// `load` fired
    Load,
    /// `load` fired and no requests in flight for the idle window
    #[default]
    NetworkIdle,
}

/// Body of `POST /scrape`
///
/// Only `url` is meaningful without a default; an empty `url` is rejected
/// by [`ScrapeRequest::validate`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrapeRequest {
    pub url: String,
    pub notify_api: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: u64,
    pub full_page: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub wait_until: WaitUntil,
    pub autoscroll: bool,
    /// Accepted for request compatibility. The settle-based scroll decides
    /// its own round count.
    pub autoscroll_steps: u32,
    /// Delay between autoscroll rounds.
    pub autoscroll_delay_ms: u64,
    pub screenshot_retries: u32,
    pub screenshot_retry_delay_ms: u64,
}

impl Default for ScrapeRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            notify_api: None,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            timeout_ms: 30_000,
            full_page: true,
            viewport_width: 1280,
            viewport_height: 1080,
            wait_until: WaitUntil::default(),
            autoscroll: true,
            autoscroll_steps: 12,
            autoscroll_delay_ms: 250,
            screenshot_retries: 2,
            screenshot_retry_delay_ms: 750,
        }
    }
}

impl ScrapeRequest {
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.viewport_width,
            height: self.viewport_height,
        }
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn autoscroll_delay(&self) -> Duration {
        Duration::from_millis(self.autoscroll_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.screenshot_retry_delay_ms)
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Reject requests that cannot be captured before any browser is launched.
    pub fn validate(&self) -> Result<(), CaptureError> {
        crate::validate_url(&self.url)
            .map_err(|e| CaptureError::InvalidRequest(format!("url: {e}")))?;

        if let Some(notify_api) = &self.notify_api {
            crate::validate_url(notify_api)
                .map_err(|e| CaptureError::InvalidRequest(format!("notify_api: {e}")))?;
        }

        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err(CaptureError::InvalidRequest(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(CaptureError::InvalidRequest(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.screenshot_retries > MAX_SCREENSHOT_RETRIES {
            return Err(CaptureError::InvalidRequest(format!(
                "screenshot_retries must be at most {MAX_SCREENSHOT_RETRIES}"
            )));
        }

        Ok(())
    }
}

/// Body of `POST /send`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendRequest {
    pub target_api: String,
    pub screenshot_base64: String,
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,
}

/// A finished capture
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureResult {
    pub screenshot_base64: String,
    pub content_type: String,
    pub title: String,
    pub final_url: String,
    pub viewport: Viewport,
    /// Whether the returned image spans the full document. False when the
    /// viewport fallback produced it.
    pub full_page: bool,
}

impl CaptureResult {
    /// Metadata forwarded alongside the image to a notify endpoint.
    pub fn notify_meta(&self, requested_url: &str) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("url".to_string(), Value::String(requested_url.to_string()));
        meta.insert("title".to_string(), Value::String(self.title.clone()));
        meta.insert("final_url".to_string(), Value::String(self.final_url.clone()));
        meta.insert(
            "viewport".to_string(),
            serde_json::json!({ "width": self.viewport.width, "height": self.viewport.height }),
        );
        meta
    }
}

/// Generate Chrome command-line arguments for one capture session
///
/// The `--user-data-dir` switch is added by the browser config builder; the
/// switches here tune headless rendering for screenshot work.
///
/// # Examples
///
/// ```rust
/// use webshot_relay::{Config, Viewport, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default(), Viewport { width: 800, height: 600 });
/// assert!(args.contains(&"--window-size=800,600".to_string()));
/// ```
pub fn get_chrome_args(config: &Config, viewport: Viewport) -> Vec<String> {
    let mut args = vec![
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--autoplay-policy=user-gesture-required".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
    ];

    args.extend(config.extra_chrome_args.iter().cloned());
    args
}

/// Build the launch configuration for an isolated, sandbox-disabled session.
pub fn create_browser_config(
    config: &Config,
    viewport: Viewport,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;
    use chromiumoxide::handler::viewport::Viewport as ChromeViewport;

    let chrome_viewport = ChromeViewport {
        width: viewport.width,
        height: viewport.height,
        device_scale_factor: Some(DEVICE_SCALE_FACTOR),
        emulating_mobile: false,
        has_touch: false,
        is_landscape: viewport.width > viewport.height,
    };

    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .user_data_dir(user_data_dir)
        .window_size(viewport.width, viewport.height)
        .viewport(chrome_viewport)
        .args(get_chrome_args(config, viewport));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunchFailed)
}
