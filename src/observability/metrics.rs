//! # Prometheus Metrics
//!
//! Components record through the `metrics` facade; this module installs the Prometheus
//! recorder whose handle renders the admin `/metrics` endpoint.
//!
//! Series recorded across the crate:
//! - `gateway_requests_total{route,status}`
//! - `gateway_request_duration_seconds{route}`
//! - `gateway_rate_limit_decisions_total{decision}`
//! - `gateway_circuit_transitions_total{service,to}`
//! - `gateway_circuit_rejections_total{service}`
//! - `gateway_health_checks_total{service,result}`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the global Prometheus recorder and return its render handle
pub fn install_prometheus() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}

/// Record one completed gateway request
///
/// `route` is the matched prefix, or `unmatched` so unknown paths cannot explode label
/// cardinality.
pub fn record_request(route: &str, status: u16, elapsed: Duration) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "gateway_request_duration_seconds",
        "route" => route.to_string()
    )
    .record(elapsed.as_secs_f64());
}
