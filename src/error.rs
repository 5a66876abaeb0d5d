use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Page navigation timeout after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Page navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Screenshot failed: {0}")]
    CaptureFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl CaptureError {
    /// Whether another screenshot attempt on the same page can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::CaptureFailed(_) | CaptureError::PageError(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CaptureError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CaptureError::NavigationTimeout(_)
            | CaptureError::NavigationFailed(_)
            | CaptureError::CaptureFailed(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for the outcome dimension of capture metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::InvalidRequest(_) => "invalid_request",
            CaptureError::ConfigurationError(_) => "configuration",
            CaptureError::BrowserLaunchFailed(_) => "browser_launch",
            CaptureError::NavigationTimeout(_) => "navigation_timeout",
            CaptureError::NavigationFailed(_) => "navigation_failed",
            CaptureError::CaptureFailed(_) => "capture_failed",
            CaptureError::PageError(_) => "page_error",
            CaptureError::IoError(_) => "io",
            CaptureError::SerializationError(_) => "serialization",
            CaptureError::SemaphoreError(_) => "semaphore",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("Invalid target endpoint: {0}")]
    InvalidTarget(String),

    #[error("Callback request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Callback request failed: {0}")]
    Request(String),
}

/// Error returned by the HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// Request body that could not be read as the expected JSON
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Capture(err) => err.status_code(),
            ApiError::Notify(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Rejected { status, .. } => *status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            ApiError::Capture(CaptureError::NavigationTimeout(_)) => {
                "Page navigation timeout".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::PageError(err.to_string())
    }
}

impl From<AcquireError> for CaptureError {
    fn from(err: AcquireError) -> Self {
        CaptureError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for NotifyError {
    fn from(err: url::ParseError) -> Self {
        NotifyError::InvalidTarget(err.to_string())
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            NotifyError::InvalidTarget(err.to_string())
        } else {
            NotifyError::Request(err.to_string())
        }
    }
}
