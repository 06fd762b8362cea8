use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Gauge: number of loaded facilities.
pub const FACILITIES_ACTIVE: &str = "innkeep_facilities_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "innkeep_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations accepted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "innkeep_reservations_created_total";

/// Counter: writes refused because the resource was already held.
pub const CONFLICTS_TOTAL: &str = "innkeep_conflicts_total";

/// Counter: lifecycle transitions applied. Labels: op.
pub const TRANSITIONS_TOTAL: &str = "innkeep_transitions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::RetireResource { .. } => "retire_resource",
        Command::MarkClean { .. } => "mark_clean",
        Command::InsertReservation(_) => "insert_reservation",
        Command::AssignResource { .. } => "assign_resource",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations(_) => "select_reservations",
        Command::SearchReservations { .. } => "search_reservations",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectSuggestions { .. } => "select_suggestions",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectBoard { .. } => "select_board",
        Command::SelectArrivals { .. } => "select_arrivals",
        Command::SelectDepartures { .. } => "select_departures",
        Command::SelectDashboard { .. } => "select_dashboard",
    }
}
