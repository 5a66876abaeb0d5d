//! Per-request browser sessions
//!
//! Every capture gets its own Chrome process with a private user-data
//! directory. This module owns launching and tearing down that process,
//! blocking media downloads, tracking in-flight network requests and
//! navigating with a caller-chosen completion condition.

use crate::{create_browser_config, CaptureError, Config, Viewport, WaitUntil};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventDomContentEventFired, EventLoadEventFired, NavigateParams,
};
use chromiumoxide::page::Page;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A launched browser plus the task pumping its DevTools connection
pub struct BrowserSession {
    pub id: String,
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
}

impl BrowserSession {
    pub async fn launch(config: &Config, viewport: Viewport) -> Result<Self, CaptureError> {
        let id = uuid::Uuid::new_v4().to_string();
        let user_data_dir = std::env::temp_dir().join(format!("webshot-relay-{id}"));

        tokio::fs::create_dir_all(&user_data_dir).await.map_err(|e| {
            CaptureError::BrowserLaunchFailed(format!("Failed to create user data dir: {e}"))
        })?;

        let launched = match create_browser_config(config, viewport, &user_data_dir) {
            Ok(browser_config) => Browser::launch(browser_config)
                .await
                .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string())),
            Err(e) => Err(e),
        };

        let (browser, mut handler) = match launched {
            Ok(pair) => pair,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&user_data_dir).await;
                return Err(e);
            }
        };

        // The handler is a Stream and must be polled for any CDP command to complete
        let session_id = id.clone();
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Session {} handler error: {}", session_id, e);
                }
            }
            debug!("Session {} handler stream ended", session_id);
        });

        info!("Browser session {} launched", id);

        Ok(Self {
            id,
            browser,
            handler,
            user_data_dir,
        })
    }

    pub async fn new_page(&self) -> Result<Page, CaptureError> {
        Ok(self.browser.new_page("about:blank").await?)
    }

    /// Shut the browser down and remove its profile directory.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("Session {} close command failed: {}", self.id, e);
        }

        match timeout(Duration::from_secs(5), self.browser.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("Session {} wait failed: {}", self.id, e),
            Err(_) => {
                warn!("Session {} did not exit in time, killing", self.id);
                let _ = self.browser.kill().await;
            }
        }

        self.handler.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!(
                "Session {} could not remove {}: {}",
                self.id,
                self.user_data_dir.display(),
                e
            );
        }

        info!("Browser session {} closed", self.id);
    }
}

/// Audio and video streams keep the network busy and stall idle detection.
/// Poster frames arrive as image resources and are never blocked.
pub fn is_blocked_resource(resource_type: &ResourceType) -> bool {
    matches!(resource_type, ResourceType::Media)
}

/// Abort every media request the page issues for as long as the returned task runs.
pub async fn block_media_requests(page: &Page) -> Result<JoinHandle<()>, CaptureError> {
    let mut paused = page.event_listener::<EventRequestPaused>().await?;

    let pattern = RequestPattern::builder()
        .url_pattern("*")
        .resource_type(ResourceType::Media)
        .build();
    page.execute(FetchEnableParams::builder().pattern(pattern).build())
        .await?;

    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let outcome = if is_blocked_resource(&event.resource_type) {
                debug!("Blocking media request {}", event.request.url);
                page.execute(FailRequestParams::new(
                    event.request_id.clone(),
                    ErrorReason::BlockedByClient,
                ))
                .await
                .map(|_| ())
            } else {
                page.execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await
                    .map(|_| ())
            };

            if let Err(e) = outcome {
                debug!("Failed to resolve paused request: {}", e);
            }
        }
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started(String),
    Finished(String),
}

/// Set of request ids the page is still waiting on
#[derive(Debug, Default)]
pub struct InflightRequests {
    ids: HashSet<String>,
}

impl InflightRequests {
    pub fn apply(&mut self, event: NetworkEvent) {
        match event {
            // Redirect hops reuse the id, so inserting twice is harmless
            NetworkEvent::Started(id) => {
                self.ids.insert(id);
            }
            NetworkEvent::Finished(id) => {
                self.ids.remove(&id);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_idle(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Tracks network activity of one page from before navigation until capture
pub struct NetworkIdleWatcher {
    events: BoxStream<'static, NetworkEvent>,
    inflight: InflightRequests,
}

impl NetworkIdleWatcher {
    /// Must be attached before navigating so no request start is missed.
    pub async fn attach(page: &Page) -> Result<Self, CaptureError> {
        let started = page
            .event_listener::<EventRequestWillBeSent>()
            .await?
            .map(|e| NetworkEvent::Started(e.request_id.inner().clone()));
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await?
            .map(|e| NetworkEvent::Finished(e.request_id.inner().clone()));
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await?
            .map(|e| NetworkEvent::Finished(e.request_id.inner().clone()));

        Ok(Self::from_stream(
            futures::stream::select_all(vec![started.boxed(), finished.boxed(), failed.boxed()])
                .boxed(),
        ))
    }

    pub fn from_stream(events: BoxStream<'static, NetworkEvent>) -> Self {
        Self {
            events,
            inflight: InflightRequests::default(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.count()
    }

    /// Resolve once nothing has been in flight for `window`, or fail after `budget`.
    pub async fn wait_for_idle(
        &mut self,
        window: Duration,
        budget: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        timeout(budget, self.settle(window)).await
    }

    async fn settle(&mut self, window: Duration) {
        loop {
            if self.inflight.is_idle() {
                match timeout(window, self.events.next()).await {
                    Err(_) => return,
                    Ok(Some(event)) => self.inflight.apply(event),
                    Ok(None) => return,
                }
            } else {
                match self.events.next().await {
                    Some(event) => self.inflight.apply(event),
                    None => return,
                }
            }
        }
    }
}

/// Navigate `page` to `url` and wait for the requested completion condition.
///
/// The whole sequence is bounded by `budget`; running out of it is a
/// [`CaptureError::NavigationTimeout`]. An error page reported by the
/// browser (DNS failure, refused connection) is a
/// [`CaptureError::NavigationFailed`].
pub async fn navigate(
    page: &Page,
    url: &str,
    wait_until: WaitUntil,
    idle: &mut NetworkIdleWatcher,
    idle_window: Duration,
    budget: Duration,
) -> Result<(), CaptureError> {
    let mut dom_ready = page.event_listener::<EventDomContentEventFired>().await?;
    let mut loaded = page.event_listener::<EventLoadEventFired>().await?;

    let navigation = async {
        let response = page.execute(NavigateParams::new(url)).await?;
        if let Some(error_text) = &response.result.error_text {
            return Err(CaptureError::NavigationFailed(error_text.clone()));
        }

        match wait_until {
            WaitUntil::Commit => {}
            WaitUntil::DomContentLoaded => {
                dom_ready.next().await;
            }
            WaitUntil::Load => {
                loaded.next().await;
            }
            WaitUntil::NetworkIdle => {
                loaded.next().await;
                idle.settle(idle_window).await;
            }
        }

        Ok::<(), CaptureError>(())
    };

    match timeout(budget, navigation).await {
        Ok(result) => result,
        Err(_) => Err(CaptureError::NavigationTimeout(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn only_media_is_blocked() {
        assert!(is_blocked_resource(&ResourceType::Media));
        assert!(!is_blocked_resource(&ResourceType::Image));
        assert!(!is_blocked_resource(&ResourceType::Document));
        assert!(!is_blocked_resource(&ResourceType::Script));
    }

    #[test]
    fn inflight_tracks_start_and_finish() {
        let mut inflight = InflightRequests::default();
        inflight.apply(NetworkEvent::Started("1".to_string()));
        inflight.apply(NetworkEvent::Started("2".to_string()));
        inflight.apply(NetworkEvent::Started("2".to_string()));
        assert_eq!(inflight.count(), 2);

        inflight.apply(NetworkEvent::Finished("1".to_string()));
        inflight.apply(NetworkEvent::Finished("unknown".to_string()));
        assert_eq!(inflight.count(), 1);
        assert!(!inflight.is_idle());

        inflight.apply(NetworkEvent::Finished("2".to_string()));
        assert!(inflight.is_idle());
    }

    #[tokio::test]
    async fn idle_resolves_once_requests_finish() {
        let events = stream::iter(vec![
            NetworkEvent::Started("a".to_string()),
            NetworkEvent::Started("b".to_string()),
            NetworkEvent::Finished("a".to_string()),
            NetworkEvent::Finished("b".to_string()),
        ])
        .chain(stream::pending())
        .boxed();

        let mut watcher = NetworkIdleWatcher::from_stream(events);
        let result = watcher
            .wait_for_idle(Duration::from_millis(20), Duration::from_secs(2))
            .await;

        assert!(result.is_ok());
        assert_eq!(watcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn idle_times_out_while_a_request_hangs() {
        let events = stream::iter(vec![NetworkEvent::Started("stuck".to_string())])
            .chain(stream::pending())
            .boxed();

        let mut watcher = NetworkIdleWatcher::from_stream(events);
        let result = watcher
            .wait_for_idle(Duration::from_millis(20), Duration::from_millis(100))
            .await;

        assert!(result.is_err());
        assert_eq!(watcher.in_flight(), 1);
    }
}
