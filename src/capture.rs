//! Capture controller
//!
//! `CaptureService` turns a [`ScrapeRequest`] into a [`CaptureResult`]:
//! it launches an isolated browser, navigates, prepares the page and takes
//! the screenshot with bounded retries. The browser is torn down on every
//! exit path.

use crate::{
    block_media_requests, encode_base64, format_duration, navigate, png_dimensions,
    BrowserSession, CaptureError, CaptureResult, Config, Metrics, NetworkIdleWatcher,
    PagePreparer, PrepareOptions, ScrapeRequest, DEVICE_SCALE_FACTOR,
};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Anything that can produce a screenshot for a scrape request
///
/// The HTTP layer depends on this trait rather than on the browser-backed
/// service directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageCapturer: Send + Sync {
    async fn capture(&self, request: &ScrapeRequest) -> Result<CaptureResult, CaptureError>;
}

/// Whether attempt `attempt` (zero-based) out of `attempts` captures the full page
///
/// With `viewport_fallback` on, a full-page request degrades to a viewport
/// capture on its final retry. A single attempt never falls back.
///
/// # Examples
///
/// ```rust
/// use webshot_relay::attempt_is_full_page;
///
/// let plan: Vec<bool> = (0..3).map(|a| attempt_is_full_page(a, 3, true, true)).collect();
/// assert_eq!(plan, vec![true, true, false]);
/// assert!(attempt_is_full_page(2, 3, true, false));
/// ```
pub fn attempt_is_full_page(
    attempt: u32,
    attempts: u32,
    full_page: bool,
    viewport_fallback: bool,
) -> bool {
    let last = attempts > 1 && attempt.saturating_add(1) == attempts;
    full_page && !(viewport_fallback && last)
}

/// Screenshot retry schedule for one capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub full_page: bool,
    pub retries: u32,
    pub viewport_fallback: bool,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub fn full_page_for(&self, attempt: u32) -> bool {
        attempt_is_full_page(attempt, self.attempts(), self.full_page, self.viewport_fallback)
    }
}

/// Run `shoot` until it yields a PNG or the policy is exhausted.
///
/// `shoot` receives the full-page flag for the attempt. Returns the PNG and
/// the flag it was taken with, or the last error. A non-retryable error
/// ends the loop immediately.
pub async fn retry_screenshot<F, Fut>(
    policy: RetryPolicy,
    metrics: &Metrics,
    mut shoot: F,
) -> Result<(Vec<u8>, bool), CaptureError>
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, CaptureError>>,
{
    let attempts = policy.attempts();
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            metrics.record_retry();
            sleep(policy.delay).await;
        }

        let full_page = policy.full_page_for(attempt);
        match shoot(full_page).await {
            Ok(png) => return Ok((png, full_page)),
            Err(e) => {
                warn!(
                    "Screenshot attempt {}/{} failed (full_page={}): {}",
                    attempt + 1,
                    attempts,
                    full_page,
                    e
                );
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable {
                    break;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| CaptureError::CaptureFailed("no screenshot attempt made".to_string())))
}

pub struct CaptureService {
    config: Config,
    preparer: PagePreparer,
    limiter: Arc<Semaphore>,
    metrics: Metrics,
}

impl CaptureService {
    pub fn new(config: Config) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_captures));
        let preparer = PagePreparer::new(config.autoscroll.clone());

        Self {
            config,
            preparer,
            limiter,
            metrics: Metrics::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sessions currently running.
    pub fn active_captures(&self) -> usize {
        self.config.max_concurrent_captures - self.limiter.available_permits()
    }

    pub async fn capture_page(
        &self,
        request: &ScrapeRequest,
    ) -> Result<CaptureResult, CaptureError> {
        request.validate()?;

        let permit = self.limiter.acquire().await?;
        self.metrics.set_active_captures(self.active_captures());
        let start_time = Instant::now();

        let result = match BrowserSession::launch(&self.config, request.viewport()).await {
            Ok(session) => {
                let result = self.capture_in_session(&session, request).await;
                session.close().await;
                result
            }
            Err(e) => Err(e),
        };

        let duration = start_time.elapsed();
        match &result {
            Ok(_) => {
                info!("Captured {} in {}", request.url, format_duration(duration));
                self.metrics.record_capture(duration, "success");
            }
            Err(e) => {
                warn!(
                    "Capture of {} failed after {}: {}",
                    request.url,
                    format_duration(duration),
                    e
                );
                self.metrics.record_capture(duration, e.kind());
            }
        }

        drop(permit);
        self.metrics.set_active_captures(self.active_captures());
        result
    }

    async fn capture_in_session(
        &self,
        session: &BrowserSession,
        request: &ScrapeRequest,
    ) -> Result<CaptureResult, CaptureError> {
        let page = session.new_page().await?;
        debug!("Session {} opened page for {}", session.id, request.url);

        let result = self.render_and_capture(&page, request).await;

        if let Err(e) = page.close().await {
            debug!("Session {} failed to close page: {}", session.id, e);
        }

        result
    }

    async fn render_and_capture(
        &self,
        page: &Page,
        request: &ScrapeRequest,
    ) -> Result<CaptureResult, CaptureError> {
        let viewport = request.viewport();

        page.execute(SetUserAgentOverrideParams::new(request.user_agent()))
            .await?;

        let emulation_params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(DEVICE_SCALE_FACTOR)
            .mobile(false)
            .build()
            .map_err(CaptureError::PageError)?;
        page.execute(emulation_params).await?;

        let media_blocker = block_media_requests(page).await?;
        let result = self.navigate_and_capture(page, request).await;
        media_blocker.abort();

        result
    }

    async fn navigate_and_capture(
        &self,
        page: &Page,
        request: &ScrapeRequest,
    ) -> Result<CaptureResult, CaptureError> {
        let mut idle = NetworkIdleWatcher::attach(page).await?;

        navigate(
            page,
            &request.url,
            request.wait_until,
            &mut idle,
            self.config.navigation_idle_window,
            request.navigation_timeout(),
        )
        .await?;
        debug!("Navigation to {} complete", request.url);

        self.preparer
            .prepare(
                page,
                &PrepareOptions {
                    autoscroll: request.autoscroll,
                    scroll_delay: request.autoscroll_delay(),
                    asset_budget: self.config.asset_wait_timeout,
                },
            )
            .await;

        sleep(self.config.settle_delay).await;

        if idle
            .wait_for_idle(
                self.config.navigation_idle_window,
                self.config.idle_recheck_timeout,
            )
            .await
            .is_err()
        {
            debug!(
                "Network still busy after preparation ({} in flight), capturing anyway",
                idle.in_flight()
            );
        }

        let (png, full_page) = self.screenshot_with_retry(page, request).await?;

        let title = page.get_title().await.ok().flatten().unwrap_or_default();
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| request.url.clone());

        Ok(CaptureResult {
            screenshot_base64: encode_base64(&png),
            content_type: PNG_CONTENT_TYPE.to_string(),
            title,
            final_url,
            viewport: request.viewport(),
            full_page,
        })
    }

    async fn screenshot_with_retry(
        &self,
        page: &Page,
        request: &ScrapeRequest,
    ) -> Result<(Vec<u8>, bool), CaptureError> {
        let policy = RetryPolicy {
            full_page: request.full_page,
            retries: request.screenshot_retries,
            viewport_fallback: self.config.viewport_fallback,
            delay: request.retry_delay(),
        };

        retry_screenshot(policy, &self.metrics, move |full_page| {
            self.take_screenshot(page, full_page, request)
        })
        .await
    }

    async fn take_screenshot(
        &self,
        page: &Page,
        full_page: bool,
        request: &ScrapeRequest,
    ) -> Result<Vec<u8>, CaptureError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();

        let budget = request.navigation_timeout();
        let png = match timeout(budget, page.screenshot(params)).await {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => return Err(CaptureError::CaptureFailed(e.to_string())),
            Err(_) => {
                return Err(CaptureError::CaptureFailed(format!(
                    "screenshot timed out after {budget:?}"
                )))
            }
        };

        let (width, height) = png_dimensions(&png)
            .map_err(|e| CaptureError::CaptureFailed(format!("invalid PNG data: {e}")))?;
        debug!(
            "Screenshot {}x{} ({} bytes, full_page={})",
            width,
            height,
            png.len(),
            full_page
        );

        Ok(png)
    }
}

#[async_trait]
impl PageCapturer for CaptureService {
    async fn capture(&self, request: &ScrapeRequest) -> Result<CaptureResult, CaptureError> {
        self.capture_page(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(full_page: bool, retries: u32, viewport_fallback: bool) -> Vec<bool> {
        let policy = RetryPolicy {
            full_page,
            retries,
            viewport_fallback,
            delay: Duration::ZERO,
        };
        (0..policy.attempts()).map(|a| policy.full_page_for(a)).collect()
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            full_page: true,
            retries,
            viewport_fallback: true,
            delay: Duration::from_millis(750),
        }
    }

    #[test]
    fn plan_without_retries_is_a_single_attempt() {
        assert_eq!(plan(true, 0, true), vec![true]);
        assert_eq!(plan(false, 0, true), vec![false]);
    }

    #[test]
    fn fallback_only_touches_the_final_attempt() {
        assert_eq!(plan(true, 2, true), vec![true, true, false]);
        assert_eq!(plan(true, 1, true), vec![true, false]);
    }

    #[test]
    fn identical_retries_without_fallback() {
        assert_eq!(plan(true, 3, false), vec![true; 4]);
    }

    #[test]
    fn viewport_requests_never_become_full_page() {
        assert_eq!(plan(false, 2, true), vec![false; 3]);
        assert_eq!(plan(false, 2, false), vec![false; 3]);
    }

    #[test]
    fn attempt_count_saturates() {
        let huge = policy(u32::MAX);
        assert_eq!(huge.attempts(), u32::MAX);
        assert!(huge.full_page_for(0));
        assert!(!huge.full_page_for(u32::MAX - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_viewport_fallback_succeeds() {
        let mut calls = Vec::new();
        let start = tokio::time::Instant::now();

        let result = retry_screenshot(policy(2), &Metrics::new(), |full_page| {
            calls.push(full_page);
            let outcome = if full_page {
                Err(CaptureError::CaptureFailed("page too tall".to_string()))
            } else {
                Ok(b"png".to_vec())
            };
            async move { outcome }
        })
        .await;

        assert_eq!(result.unwrap(), (b"png".to_vec(), false));
        assert_eq!(calls, vec![true, true, false]);
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_the_last_error() {
        let mut attempt = 0;

        let err = retry_screenshot(policy(2), &Metrics::new(), |_| {
            attempt += 1;
            let message = format!("attempt {attempt} failed");
            async move { Err(CaptureError::CaptureFailed(message)) }
        })
        .await
        .unwrap_err();

        assert_eq!(attempt, 3);
        assert!(matches!(&err, CaptureError::CaptureFailed(m) if m == "attempt 3 failed"));
        assert_eq!(err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_after_one_attempt() {
        let mut attempts = 0;

        let err = retry_screenshot(policy(2), &Metrics::new(), |_| {
            attempts += 1;
            async { Err(CaptureError::BrowserLaunchFailed("browser gone".to_string())) }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert!(matches!(err, CaptureError::BrowserLaunchFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_keeps_the_full_page_flag() {
        let result = retry_screenshot(policy(2), &Metrics::new(), |_| async {
            Ok(b"png".to_vec())
        })
        .await;

        assert_eq!(result.unwrap(), (b"png".to_vec(), true));
    }

    #[tokio::test]
    async fn invalid_request_fails_before_launching_a_browser() {
        let service = CaptureService::new(Config {
            chrome_path: Some("/nonexistent/chrome".to_string()),
            ..Default::default()
        });

        let request = ScrapeRequest {
            url: "not a url".to_string(),
            ..Default::default()
        };

        let err = service.capture_page(&request).await.unwrap_err();
        assert!(matches!(err, CaptureError::InvalidRequest(_)));
        assert_eq!(service.active_captures(), 0);
    }

    #[tokio::test]
    async fn missing_browser_is_a_launch_failure() {
        let service = CaptureService::new(Config {
            chrome_path: Some("/nonexistent/chrome".to_string()),
            ..Default::default()
        });

        let request = ScrapeRequest {
            url: "https://example.com".to_string(),
            ..Default::default()
        };

        let err = service.capture_page(&request).await.unwrap_err();
        assert!(matches!(err, CaptureError::BrowserLaunchFailed(_)));
        assert_eq!(service.active_captures(), 0);
    }
}
