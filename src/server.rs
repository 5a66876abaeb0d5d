//! HTTP surface
//!
//! `POST /scrape` captures and optionally forwards, `POST /send` only
//! forwards. Notification problems never fail `/scrape` but do fail
//! `/send`.

use crate::{
    ApiError, CaptureError, CaptureResult, NotifyError, NotifyOutcome, Notifier, PageCapturer,
    ScrapeRequest, SendRequest,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub capturer: Arc<dyn PageCapturer>,
    pub notifier: Notifier,
    pub max_concurrent_captures: usize,
    pub prometheus: Option<PrometheusHandle>,
    active: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        capturer: Arc<dyn PageCapturer>,
        notifier: Notifier,
        max_concurrent_captures: usize,
    ) -> Self {
        Self {
            capturer,
            notifier,
            max_concurrent_captures,
            prometheus: None,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Scrape captures in progress or queued behind the concurrency limit.
    pub fn active_captures(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Counts a capture as active for as long as it lives
struct ActiveCapture(Arc<AtomicUsize>);

impl ActiveCapture {
    fn start(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveCapture {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeResponse {
    pub ok: bool,
    pub data: CaptureResult,
    /// JSON text of the delivery outcome, or of `{"error": ...}` when it failed
    pub notify_result: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub ok: bool,
    pub result: NotifyOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// `/scrape` requests in progress, including those still waiting for a browser slot
    pub active_captures: usize,
    pub max_concurrent_captures: usize,
    pub timestamp: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/scrape", post(scrape_handler))
        .route("/send", post(send_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn scrape_handler(
    State(state): State<AppState>,
    payload: Result<Json<ScrapeRequest>, JsonRejection>,
) -> Result<Json<ScrapeResponse>, ApiError> {
    let Json(req) = payload?;
    info!("Scrape request for {}", req.url);
    req.validate()?;

    // Detached so a client hanging up cannot cut the browser teardown short
    let capturer = state.capturer.clone();
    let active = state.active.clone();
    let request = req.clone();
    let data = tokio::spawn(async move {
        let _active = ActiveCapture::start(active);
        capturer.capture(&request).await
    })
    .await
    .map_err(|e| CaptureError::PageError(format!("capture task failed: {e}")))??;

    let notify_result = match &req.notify_api {
        Some(target) => {
            let outcome = state
                .notifier
                .send(target, &data.screenshot_base64, Some(data.notify_meta(&req.url)))
                .await;
            Some(describe_notify_result(outcome))
        }
        None => None,
    };

    Ok(Json(ScrapeResponse {
        ok: true,
        data,
        notify_result,
    }))
}

async fn send_handler(
    State(state): State<AppState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, ApiError> {
    let Json(req) = payload?;
    info!("Send request for {}", req.target_api);

    let result = state
        .notifier
        .send(&req.target_api, &req.screenshot_base64, req.meta)
        .await?;

    Ok(Json(SendResponse { ok: true, result }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_captures: state.active_captures(),
        max_concurrent_captures: state.max_concurrent_captures,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Flatten a delivery outcome into the string reported by `/scrape`.
pub fn describe_notify_result(result: Result<NotifyOutcome, NotifyError>) -> String {
    match result {
        Ok(outcome) => serde_json::to_string(&outcome).unwrap_or_else(|e| {
            debug!("Could not encode notify outcome: {}", e);
            format!("{outcome:?}")
        }),
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    }
}
