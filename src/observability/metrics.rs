//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fleet_instances_live` (gauge): proxy instances currently registered
//! - `fleet_instances_created_total` (counter): successful create calls
//! - `fleet_requests_total` (counter): proxied requests by port and outcome
//! - `fleet_request_duration_seconds` (histogram): engine latency by port
//! - `fleet_quiescence_waits_total` (counter): waits by result
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Prometheus exposition is opt-in (`observability.metrics_enabled`)

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_instance_created(live: usize) {
    metrics::counter!("fleet_instances_created_total").increment(1);
    metrics::gauge!("fleet_instances_live").set(live as f64);
}

pub fn record_instance_deleted(live: usize) {
    metrics::gauge!("fleet_instances_live").set(live as f64);
}

/// Record one request serviced by an instance's engine.
pub fn record_request(port: u16, outcome: &'static str, start: Instant) {
    let port = port.to_string();
    metrics::counter!("fleet_requests_total", "port" => port.clone(), "outcome" => outcome).increment(1);
    metrics::histogram!("fleet_request_duration_seconds", "port" => port).record(start.elapsed().as_secs_f64());
}

pub fn record_quiescence_wait(result: &'static str) {
    metrics::counter!("fleet_quiescence_waits_total", "result" => result).increment(1);
}
