//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, latency, cache/coalescing/guard events)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_requests_total` (counter): total requests by method, status
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_cache_events_total` (counter): cache outcomes by event
//! - `proxy_coalesced_requests_total` (counter): coalescer decisions by role
//! - `proxy_guard_rewrites_total` (counter): broken responses replaced
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Histogram buckets tuned for typical web latencies

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Instant;

use ::metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

static DESCRIPTIONS: Once = Once::new();

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install()?;
    describe_metrics();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe_metrics() {
    DESCRIPTIONS.call_once(|| {
        describe_counter!("proxy_requests_total", Unit::Count, "Requests served, by method and status.");
        describe_histogram!(
            "proxy_request_duration_seconds",
            Unit::Seconds,
            "Time from request arrival to response head."
        );
        describe_counter!(
            "proxy_cache_events_total",
            Unit::Count,
            "Cache outcomes: hit, create, update, stale, fresh, skip, bypass, store_error."
        );
        describe_counter!(
            "proxy_coalesced_requests_total",
            Unit::Count,
            "Coalescer decisions: leader, follower, bypass."
        );
        describe_counter!(
            "proxy_guard_rewrites_total",
            Unit::Count,
            "Broken responses replaced with the reload page."
        );
    });
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_event(event: &'static str) {
    counter!("proxy_cache_events_total", "event" => event).increment(1);
}

pub fn record_coalesced(role: &'static str) {
    counter!("proxy_coalesced_requests_total", "role" => role).increment(1);
}

pub fn record_guard_rewrite() {
    counter!("proxy_guard_rewrites_total").increment(1);
}
