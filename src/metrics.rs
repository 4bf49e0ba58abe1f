//! Metrics emitted through the `metrics` facade.
//!
//! Covers broker link status and publish outcomes, failover and
//! degraded delivery, registry depth, RPC round-trip latency/timeouts/
//! errors, and per-source sync cycle progress. Everything is prefixed
//! `relay_`; counters end in `_total`, gauges carry current state, and
//! histograms record durations in seconds.
//!
//! ```rust,no_run
//! use telemetry_relay::metrics;
//! use telemetry_relay::transport::LinkKind;
//!
//! // In the transport adapter after a publish attempt
//! metrics::record_publish(LinkKind::Primary, true);
//!
//! // In the scheduler after a completed cycle
//! metrics::record_cycle("logger-1", 5, 1, std::time::Duration::from_secs(2));
//! ```

use crate::envelope::OpKind;
use crate::transport::LinkKind;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Broker Link Metrics
// =============================================================================

/// Record a broker link connection attempt outcome.
pub fn record_link_connection(link: LinkKind, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_link_connections_total", "link" => link.to_string(), "status" => status)
        .increment(1);
}

/// Record broker link state transition.
pub fn record_link_state(link: LinkKind, state: &str) {
    gauge!("relay_link_state", "link" => link.to_string(), "state" => state.to_string()).set(1.0);
}

/// Record a publish attempt outcome on one link.
pub fn record_publish(link: LinkKind, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_publishes_total", "link" => link.to_string(), "status" => status).increment(1);
}

/// Record a failover: the primary publish failed and the secondary was tried.
pub fn record_publish_failover() {
    counter!("relay_publish_failovers_total").increment(1);
}

/// Record a successful operation that went through the secondary link only.
pub fn record_degraded_delivery(op: OpKind) {
    counter!("relay_degraded_deliveries_total", "op" => op.to_string()).increment(1);
}

/// Record link circuit breaker state change.
pub fn record_link_circuit_state(link: LinkKind, state: &str) {
    counter!("relay_link_circuit_transitions_total", "link" => link.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record a link health ping result.
pub fn record_link_ping(link: LinkKind, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_link_pings_total", "link" => link.to_string(), "status" => status).increment(1);
}

/// Record link health ping latency.
pub fn record_link_ping_latency(link: LinkKind, latency: Duration) {
    histogram!("relay_link_ping_latency_seconds", "link" => link.to_string())
        .record(latency.as_secs_f64());
}

// =============================================================================
// Correlation Registry Metrics
// =============================================================================

/// Gauge for the number of requests currently awaiting a reply.
pub fn set_pending_requests(count: usize) {
    gauge!("relay_pending_requests").set(count as f64);
}

/// Record a reply that matched no pending request (late or duplicate).
pub fn record_unmatched_reply(link: LinkKind) {
    counter!("relay_unmatched_replies_total", "link" => link.to_string()).increment(1);
}

// =============================================================================
// RPC Bridge Metrics
// =============================================================================

/// Record a request that expired without a correlated reply.
pub fn record_rpc_timeout(op: OpKind) {
    counter!("relay_rpc_timeouts_total", "op" => op.to_string()).increment(1);
}

/// Record a completed RPC round-trip latency.
pub fn record_rpc_latency(op: OpKind, duration: Duration) {
    histogram!("relay_rpc_duration_seconds", "op" => op.to_string())
        .record(duration.as_secs_f64());
}

/// Record an RPC failure by error kind.
pub fn record_rpc_error(op: OpKind, error_kind: &str) {
    counter!("relay_rpc_errors_total", "op" => op.to_string(), "error_kind" => error_kind.to_string())
        .increment(1);
}

// =============================================================================
// Sync Scheduler Metrics
// =============================================================================

/// Record a completed sync cycle for a source.
pub fn record_cycle(source_id: &str, synced: usize, skipped: usize, duration: Duration) {
    let source = source_id.to_string();
    counter!("relay_sync_cycles_total", "source_id" => source.clone()).increment(1);
    counter!("relay_measurements_synced_total", "source_id" => source.clone())
        .increment(synced as u64);
    if skipped > 0 {
        counter!("relay_measurements_skipped_total", "source_id" => source.clone())
            .increment(skipped as u64);
    }
    histogram!("relay_sync_cycle_duration_seconds", "source_id" => source)
        .record(duration.as_secs_f64());
}

/// Record rows shipped to the destination for one table.
pub fn record_rows_replicated(source_id: &str, table: &str, rows: u64) {
    counter!(
        "relay_rows_replicated_total",
        "source_id" => source_id.to_string(),
        "table" => table.to_string()
    )
    .increment(rows);
}

/// Record a measurement skipped this cycle, by reason.
pub fn record_measurement_skipped(source_id: &str, reason: &str) {
    counter!(
        "relay_measurement_skips_total",
        "source_id" => source_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Gauge for whether a source is in catch-up mode (1 = catching up).
pub fn set_catch_up(source_id: &str, catching_up: bool) {
    let value = if catching_up { 1.0 } else { 0.0 };
    gauge!("relay_catch_up", "source_id" => source_id.to_string()).set(value);
}

/// Record a heartbeat file write outcome.
pub fn record_heartbeat(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_heartbeats_total", "status" => status).increment(1);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for the engine lifecycle state.
pub fn set_engine_state(state: &str) {
    // Numeric encoding so alert rules can compare on it.
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("relay_engine_state").set(value);
}

/// Gauge for number of connected broker links.
pub fn set_connected_links(count: usize) {
    gauge!("relay_connected_links").set(count as f64);
}
