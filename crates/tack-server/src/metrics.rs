//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tack_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tack_connections_active";
    pub const ROOMS_ACTIVE: &str = "tack_rooms_active";
    pub const BROADCASTS_TOTAL: &str = "tack_broadcasts_total";
    pub const DELIVERIES_TOTAL: &str = "tack_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "tack_evictions_total";
    pub const SEQUENCER_OPS_TOTAL: &str = "tack_sequencer_ops_total";
    pub const SEQUENCER_CONFLICTS_TOTAL: &str = "tack_sequencer_conflicts_total";
    pub const ERRORS_TOTAL: &str = "tack_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of realtime connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active realtime connections"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of live board rooms");
    metrics::describe_counter!(names::BROADCASTS_TOTAL, "Total number of broadcast passes");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of frames delivered to room members"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Total number of connections evicted after failed delivery"
    );
    metrics::describe_counter!(
        names::SEQUENCER_OPS_TOTAL,
        "Total number of position sequencing operations"
    );
    metrics::describe_counter!(
        names::SEQUENCER_CONFLICTS_TOTAL,
        "Total number of retryable position conflicts"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a broadcast pass.
pub fn record_broadcast(delivered: usize, evicted: usize) {
    counter!(names::BROADCASTS_TOTAL).increment(1);
    counter!(names::DELIVERIES_TOTAL).increment(delivered as u64);
    if evicted > 0 {
        counter!(names::EVICTIONS_TOTAL).increment(evicted as u64);
    }
}

/// Record a sequencer operation.
pub fn record_sequencer_op(op: &'static str) {
    counter!(names::SEQUENCER_OPS_TOTAL, "op" => op).increment(1);
}

/// Record a retryable position conflict.
pub fn record_sequencer_conflict() {
    counter!(names::SEQUENCER_CONFLICTS_TOTAL).increment(1);
}

/// Update the live room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
