//! Metric helpers for `uplink`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. The optional Prometheus
//! exporter lives behind the `metrics-exporter` feature.

use metrics::{counter, gauge, histogram};

/// Name of the gauge tracking established broker connections.
pub const CONNECTIONS_ACTIVE: &str = "uplink_connections_active";
/// Name of the counter tracking reconnect attempts.
pub const RECONNECTS_TOTAL: &str = "uplink_reconnects_total";
/// Name of the counter tracking processed messages.
pub const MESSAGES_TOTAL: &str = "uplink_messages_total";
/// Name of the counter tracking messages dropped for lack of a route.
pub const UNROUTABLE_TOTAL: &str = "uplink_unroutable_messages_total";
/// Name of the counter tracking critical-connection escalations.
pub const CRITICAL_FAILURES_TOTAL: &str = "uplink_critical_failures_total";
/// Name of the histogram recording finalized payload size as a percentage of
/// the uncompressed size.
pub const COMPRESSION_PERCENT: &str = "uplink_payload_compression_percent";
/// Name of the histogram recording request/response round trips.
pub const ROUND_TRIP_SECONDS: &str = "uplink_round_trip_seconds";

/// Direction of message processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Messages received from the broker.
    Inbound,
    /// Messages published to the broker.
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

/// Decrement the active connections gauge.
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

/// Record a reconnect attempt.
pub fn inc_reconnects() { counter!(RECONNECTS_TOTAL).increment(1); }

/// Record a processed message for the given direction.
pub fn inc_messages(direction: Direction) {
    counter!(MESSAGES_TOTAL, "direction" => direction.as_str()).increment(1);
}

/// Record a message dropped for lack of a route.
pub fn inc_unroutable() { counter!(UNROUTABLE_TOTAL).increment(1); }

/// Record a critical-connection escalation.
pub fn inc_critical_failures() { counter!(CRITICAL_FAILURES_TOTAL).increment(1); }

/// Record the compression outcome of one finalized payload.
pub fn observe_compression(percent: f64) { histogram!(COMPRESSION_PERCENT).record(percent); }

/// Record one request/response round trip.
pub fn observe_round_trip(seconds: f64) { histogram!(ROUND_TRIP_SECONDS).record(seconds); }

/// Install a Prometheus exporter serving scrapes on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed, for example when a
/// global recorder is already registered.
#[cfg(feature = "metrics-exporter")]
pub fn install_prometheus_exporter(
    addr: std::net::SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}
