//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define guard metrics (breaker outcomes, idempotency events, traffic logs)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `guard_breaker_calls_total` (counter): permitted calls by breaker, outcome
//! - `guard_breaker_call_duration_seconds` (histogram): downstream latency
//! - `guard_breaker_rejections_total` (counter): denied calls by breaker
//! - `guard_idempotency_events_total` (counter): claim/replay/wait/reject events
//! - `guard_traffic_logged_total` (counter): traffic records by source
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Histogram buckets tuned for typical web latencies

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("guard_breaker_call_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install()?;

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record the outcome of a permitted breaker call.
pub fn record_breaker_call(breaker: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!(
        "guard_breaker_calls_total",
        "breaker" => breaker.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "guard_breaker_call_duration_seconds",
        "breaker" => breaker.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a call denied by an open breaker.
pub fn record_breaker_rejection(breaker: &str) {
    metrics::counter!("guard_breaker_rejections_total", "breaker" => breaker.to_string())
        .increment(1);
}

/// Record an idempotency cache event (`executed`, `replayed`, `waited`, ...).
pub fn record_idempotency_event(event: &'static str) {
    metrics::counter!("guard_idempotency_events_total", "event" => event).increment(1);
}

/// Record an emitted traffic record.
pub fn record_traffic_logged(source: &'static str) {
    metrics::counter!("guard_traffic_logged_total", "source" => source).increment(1);
}
