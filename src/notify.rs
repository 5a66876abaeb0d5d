//! Callback delivery
//!
//! Posts a captured screenshot to a caller-chosen endpoint exactly once.
//! Whatever status the endpoint answers with is reported back; only
//! transport-level problems are errors.

use crate::{truncate_chars, Metrics, NotifyError, NotifySettings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;

/// Result of one delivery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotifyOutcome {
    pub target_api: String,
    pub status_code: u16,
    pub response_text: String,
}

/// JSON body sent to the callback endpoint
#[derive(Debug, Serialize)]
pub struct NotifyPayload<'a> {
    pub screenshot_base64: &'a str,
    pub meta: &'a Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    settings: NotifySettings,
    metrics: Metrics,
}

impl Notifier {
    pub fn new(settings: NotifySettings) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        Ok(Self {
            client,
            settings,
            metrics: Metrics::new(),
        })
    }

    pub async fn send(
        &self,
        target_api: &str,
        screenshot_base64: &str,
        meta: Option<Map<String, Value>>,
    ) -> Result<NotifyOutcome, NotifyError> {
        let result = self.post(target_api, screenshot_base64, meta).await;

        match &result {
            Ok(outcome) => {
                info!(
                    "Delivered screenshot to {} (status {})",
                    outcome.target_api, outcome.status_code
                );
                self.metrics.record_notification("delivered");
            }
            Err(e) => {
                warn!("Delivery to {} failed: {}", target_api, e);
                self.metrics.record_notification("failed");
            }
        }

        result
    }

    async fn post(
        &self,
        target_api: &str,
        screenshot_base64: &str,
        meta: Option<Map<String, Value>>,
    ) -> Result<NotifyOutcome, NotifyError> {
        let target = Url::parse(target_api)?;
        let meta = meta.unwrap_or_default();
        let payload = NotifyPayload {
            screenshot_base64,
            meta: &meta,
        };

        let response = self
            .client
            .post(target)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status_code = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(NotifyOutcome {
            target_api: target_api.to_string(),
            status_code,
            response_text: truncate_chars(&body, self.settings.max_response_chars),
        })
    }

    fn classify(&self, err: reqwest::Error) -> NotifyError {
        if err.is_timeout() {
            NotifyError::Timeout(self.settings.timeout)
        } else {
            NotifyError::from(err)
        }
    }
}
