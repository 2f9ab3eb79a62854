//! Metrics helpers for Passage.
//!
//! Wraps the `metrics` crate macros with the gateway's metric families and
//! installs a Prometheus recorder whose rendered exposition backs the
//! `/metrics` endpoint. Inbound request metrics are labeled with the route
//! template (`<base_path>/*`), never the concrete path, so unmatched requests
//! cannot explode label cardinality.
use std::time::Duration;

use eyre::{Result, WrapErr};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const HTTP_REQUESTS_TOTAL: &str = "api_gateway_http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "api_gateway_http_request_duration_seconds";
pub const BACKEND_UP: &str = "api_gateway_backend_up"; // labels: service, target

/// Histogram buckets in seconds, 5ms up to 10s.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus recorder and register metric descriptions. Returns
/// the handle used to render the text exposition.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .wrap_err("Invalid histogram buckets")?
        .install_recorder()
        .wrap_err("Failed to install Prometheus recorder")?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests"
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of HTTP requests in seconds"
    );
    describe_gauge!(
        BACKEND_UP,
        "Health probe result per upstream target (1 healthy, 0 unhealthy)"
    );

    Ok(handle)
}

/// Count a completed inbound request against its route template.
pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(path: &str, method: &str, status: u16, duration: Duration) {
    metrics::histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Export the latest health probe result for a target.
pub fn set_backend_up(service: &str, target: &str, up: bool) {
    gauge!(
        BACKEND_UP,
        "service" => service.to_string(),
        "target" => target.to_string()
    )
    .set(if up { 1.0 } else { 0.0 });
}
