use metrics::{
    describe_counter, describe_gauge, describe_histogram, gauge, histogram, increment_counter,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub const CAPTURES_TOTAL: &str = "webshot_captures_total";
pub const CAPTURE_SECONDS: &str = "webshot_capture_seconds";
pub const SCREENSHOT_RETRIES_TOTAL: &str = "webshot_screenshot_retries_total";
pub const NOTIFICATIONS_TOTAL: &str = "webshot_notifications_total";
pub const ACTIVE_CAPTURES: &str = "webshot_active_captures";

/// Thin facade over the `metrics` macros
///
/// Without an installed recorder every call is a no-op, which keeps the
/// library usable from tests and the one-shot CLI.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn describe() {
        describe_counter!(CAPTURES_TOTAL, "Captures finished, labelled by outcome");
        describe_histogram!(CAPTURE_SECONDS, "Wall time of a capture including browser launch");
        describe_counter!(SCREENSHOT_RETRIES_TOTAL, "Screenshot attempts after the first");
        describe_counter!(NOTIFICATIONS_TOTAL, "Callback deliveries, labelled by outcome");
        describe_gauge!(ACTIVE_CAPTURES, "Captures currently holding a browser session");
    }

    pub fn record_capture(&self, duration: Duration, outcome: &'static str) {
        increment_counter!(CAPTURES_TOTAL, "outcome" => outcome);
        histogram!(CAPTURE_SECONDS, duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        increment_counter!(SCREENSHOT_RETRIES_TOTAL);
    }

    pub fn record_notification(&self, outcome: &'static str) {
        increment_counter!(NOTIFICATIONS_TOTAL, "outcome" => outcome);
    }

    pub fn set_active_captures(&self, count: usize) {
        gauge!(ACTIVE_CAPTURES, count as f64);
    }
}

/// Install the global Prometheus recorder. Only one recorder can exist per process.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Metrics::describe();
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}
