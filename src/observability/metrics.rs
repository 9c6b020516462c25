//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_sessions_total` (counter): client sessions accepted
//! - `relay_active_sessions` (gauge): sessions currently running
//! - `relay_session_closed_total` (counter): closed sessions by reason
//! - `relay_backend_connects_total` (counter): backend connects by result
//! - `relay_bytes_total` (counter): relayed bytes by direction
//! - `relay_protocol_violations_total` (counter)
//! - `relay_h2_streams_total` (counter): client streams opened
//! - `relay_h2_push_promises_total` (counter): promises relayed to clients
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - The Prometheus exporter serves its own HTTP listener

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::relay::CloseReason;

/// Direction of relayed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// Install the Prometheus exporter on `addr`. Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe();
            tracing::info!(address = %addr, "Metrics exporter listening");
        }
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

fn describe() {
    describe_counter!("relay_sessions_total", "Client sessions accepted");
    describe_gauge!("relay_active_sessions", "Client sessions currently running");
    describe_counter!("relay_session_closed_total", "Closed sessions by reason");
    describe_counter!("relay_backend_connects_total", "Backend connection attempts by result");
    describe_counter!("relay_bytes_total", "Relayed bytes by direction");
    describe_counter!("relay_protocol_violations_total", "Sessions closed on a protocol violation");
    describe_counter!("relay_h2_streams_total", "Client streams opened");
    describe_counter!("relay_h2_push_promises_total", "Server pushes relayed to clients");
}

pub fn record_session_opened() {
    counter!("relay_sessions_total").increment(1);
    gauge!("relay_active_sessions").increment(1.0);
}

pub fn record_session_closed(reason: CloseReason) {
    counter!("relay_session_closed_total", "reason" => reason.as_str()).increment(1);
}

/// The session task has exited.
pub fn record_session_finished() {
    gauge!("relay_active_sessions").decrement(1.0);
}

pub fn record_backend_connect(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("relay_backend_connects_total", "result" => result).increment(1);
}

pub fn record_bytes(direction: Direction, len: usize) {
    if len > 0 {
        counter!("relay_bytes_total", "direction" => direction.as_str()).increment(len as u64);
    }
}

pub fn record_protocol_violation() {
    counter!("relay_protocol_violations_total").increment(1);
}

pub fn record_h2_stream() {
    counter!("relay_h2_streams_total").increment(1);
}

pub fn record_h2_push_promise() {
    counter!("relay_h2_push_promises_total").increment(1);
}
