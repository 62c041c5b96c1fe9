use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tzledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tzledger_query_duration_seconds";

// ── Connections and tenants ─────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "tzledger_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tzledger_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tzledger_connections_rejected_total";

/// Gauge: tenants with a loaded engine.
pub const TENANTS_ACTIVE: &str = "tzledger_tenants_active";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tzledger_wal_flush_duration_seconds";

/// Histogram: records per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "tzledger_wal_flush_batch_size";

// ── Audit trail ─────────────────────────────────────────────────

/// Counter: change-log entries appended to events.
pub const CHANGELOG_ENTRIES_TOTAL: &str = "tzledger_changelog_entries_total";

/// Counter: event updates where no tracked field changed.
pub const NOOP_UPDATES_TOTAL: &str = "tzledger_noop_updates_total";

/// Serve Prometheus metrics on `port`. Does nothing when `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a parsed command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProfile { .. } => "insert_profile",
        Command::UpdateProfile { .. } => "update_profile",
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::SelectProfiles => "select_profiles",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectEventLogs { .. } => "select_event_logs",
    }
}
