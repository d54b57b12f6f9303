use std::net::SocketAddr;

use crate::sql::Command;

// ── Reservation outcomes ────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (created, conflict, timeout, transient, rejected).
pub const RESERVATIONS_TOTAL: &str = "nestbook_reservations_total";

/// Counter: rejected attempts by conflict reason. Labels: reason.
pub const CONFLICTS_TOTAL: &str = "nestbook_conflicts_total";

/// Histogram: end-to-end reservation attempt latency in seconds.
pub const RESERVE_DURATION_SECONDS: &str = "nestbook_reserve_duration_seconds";

/// Counter: reservations cancelled (state changes only, not idempotent repeats).
pub const CANCELLATIONS_TOTAL: &str = "nestbook_cancellations_total";

/// Counter: commit retries after a transient storage failure.
pub const TRANSIENT_RETRIES_TOTAL: &str = "nestbook_transient_retries_total";

/// Counter: overlapping active claims observed in storage.
pub const INTEGRITY_WARNINGS_TOTAL: &str = "nestbook_integrity_warnings_total";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "nestbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "nestbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "nestbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "nestbook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "nestbook_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "nestbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "nestbook_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "nestbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None; a
/// failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on port {port}: {e}"),
    }
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertApartment { .. } => "insert_apartment",
        Command::UpdateCapabilities { .. } => "update_capabilities",
        Command::DeleteApartment { .. } => "delete_apartment",
        Command::InsertBedroom { .. } => "insert_bedroom",
        Command::InsertBed { .. } => "insert_bed",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectApartments => "select_apartments",
        Command::SelectBedrooms { .. } => "select_bedrooms",
        Command::SelectBeds { .. } => "select_beds",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailabilitySummary { .. } => "select_availability_summary",
    }
}
