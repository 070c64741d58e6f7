//! Metrics collection and exposition.
//!
//! # Metrics
//! - `forwarder_requests_total` (counter): forwarded requests by method, status
//! - `forwarder_request_duration_seconds` (histogram): time until the last
//!   backend handle closed
//! - `forwarder_process_starts_total` (counter): launches by outcome
//! - `forwarder_process_crashes_total` (counter): unexpected backend exits
//! - `forwarder_rapid_fail_trips_total` (counter): requests refused by the breaker
//! - `forwarder_websocket_sessions_total` (counter): relayed sessions by outcome
//! - `forwarder_websocket_session_seconds` (histogram): relay lifetime
//! - `forwarder_ready_processes` (gauge): ready pool slots
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed, so library users
//!   and tests pay nothing

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = [("method", method.to_string()), ("status", status.to_string())];
    counter!("forwarder_requests_total", &labels).increment(1);
    histogram!("forwarder_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn record_process_start(success: bool) {
    let outcome = if success { "ready" } else { "failed" };
    counter!("forwarder_process_starts_total", "outcome" => outcome).increment(1);
}

pub fn record_process_crash() {
    counter!("forwarder_process_crashes_total").increment(1);
}

pub fn record_rapid_fail_trip() {
    counter!("forwarder_rapid_fail_trips_total").increment(1);
}

pub fn record_websocket_session(outcome: &'static str, duration: Duration) {
    counter!("forwarder_websocket_sessions_total", "outcome" => outcome).increment(1);
    histogram!("forwarder_websocket_session_seconds").record(duration.as_secs_f64());
}

pub fn set_ready_processes(count: usize) {
    gauge!("forwarder_ready_processes").set(count as f64);
}
