use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (confirmed, or a rejection code).
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

// ── Snapshot maintenance ────────────────────────────────────────

/// Counter: snapshot refreshes. Labels: outcome (ok, failed, coalesced).
pub const REFRESHES_TOTAL: &str = "slotwise_refreshes_total";

/// Histogram: snapshot refresh duration in seconds.
pub const REFRESH_DURATION_SECONDS: &str = "slotwise_refresh_duration_seconds";

/// Counter: refreshes that fell back to local commitments only.
pub const FEED_DEGRADED_TOTAL: &str = "slotwise_external_feed_degraded_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotwise_tenants_active";

/// Histogram: ledger group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: ledger group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFirstAvailable { .. } => "select_first_available",
        Command::SelectBookable { .. } => "select_bookable",
        Command::SelectAlternatives { .. } => "select_alternatives",
        Command::SelectOccupied { .. } => "select_occupied",
        Command::SelectContext => "select_context",
        Command::InsertCommitment { .. } => "insert_commitment",
        Command::DeleteCommitment { .. } => "delete_commitment",
        Command::InvalidateCache { .. } => "invalidate_cache",
    }
}
