//! Metrics collection and exposition.
//!
//! # Metrics
//! - `switchyard_requests_total` (counter): requests by method and status
//! - `switchyard_request_duration_seconds` (histogram): dispatch latency
//! - `switchyard_dispatch_faults_total` (counter): handler errors and panics by module
//! - `switchyard_active_connections` (gauge): live connections by kind (http, channel)
//! - `switchyard_sessions_purged_total` (counter): expired sessions removed
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is opt-in for hosts

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "switchyard_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("switchyard_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// Record a handler fault caught at the dispatcher boundary.
pub fn record_dispatch_fault(module: &str) {
    counter!("switchyard_dispatch_faults_total", "module" => module.to_string()).increment(1);
}

/// Publish the live count for a connection kind.
pub fn record_active(kind: &'static str, count: u64) {
    gauge!("switchyard_active_connections", "kind" => kind).set(count as f64);
}

pub fn record_sessions_purged(count: usize) {
    if count > 0 {
        counter!("switchyard_sessions_purged_total").increment(count as u64);
    }
}
