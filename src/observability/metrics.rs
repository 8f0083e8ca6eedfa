//! Metrics collection and exposition.
//!
//! # Metrics
//! - `h1_requests_total` (counter): requests dispatched, by method
//! - `h1_active_connections` (gauge): live HTTP/1.1 connections
//! - `h1_concurrency_rejections_total` (counter): requests answered with 503
//! - `h1_invalid_requests_total` (counter): connections closed on malformed input
//! - `h1_app_errors_total` (counter): application failures and contract violations
//! - `h1_upgrades_total` (counter): upgrade attempts, by result
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a cheap no-op (tests, embedded use)
//! - The Prometheus exporter is opt-in from the binary

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str) {
    counter!("h1_requests_total", "method" => method.to_owned()).increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!("h1_active_connections").set(count as f64);
}

pub fn record_concurrency_rejection() {
    counter!("h1_concurrency_rejections_total").increment(1);
}

pub fn record_invalid_request() {
    counter!("h1_invalid_requests_total").increment(1);
}

pub fn record_app_error() {
    counter!("h1_app_errors_total").increment(1);
}

pub fn record_upgrade(result: &'static str) {
    counter!("h1_upgrades_total", "result" => result).increment(1);
}
