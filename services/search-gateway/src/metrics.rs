//! Prometheus metrics exposition
//!
//! Service-level metrics recorded here:
//!
//! - `gateway_requests_total` (counter): labels `tool`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `tool`
//! - `gateway_rate_limited_total` (counter)
//!
//! Upstream call, rotation and credit refresh metrics are recorded by the
//! key-pool crate through the same global recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("gateway_upstream_call_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Duration metrics get explicit buckets from 5ms to 60s so they render as
/// Prometheus histograms rather than summaries.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed tool call.
pub fn record_request(tool: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "tool" => tool.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "tool" => tool.to_string())
        .record(duration_secs);
}

/// Record a call rejected by the per-client rate limiter.
pub fn record_rate_limited() {
    metrics::counter!("gateway_rate_limited_total").increment(1);
}
