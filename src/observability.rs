use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tripline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tripline_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: trips scheduled.
pub const TRIPS_SCHEDULED_TOTAL: &str = "tripline_trips_scheduled_total";

/// Counter: commitments refused because of an overlap. Labels: resource.
pub const CONFLICTS_TOTAL: &str = "tripline_conflicts_total";

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "tripline_bookings_created_total";

/// Counter: passengers skipped in a booking request. Labels: reason.
pub const BOOKINGS_SKIPPED_TOTAL: &str = "tripline_bookings_skipped_total";

/// Counter: completed reconciliation passes.
pub const RECONCILE_RUNS_TOTAL: &str = "tripline_reconcile_runs_total";

/// Counter: statuses rewritten by reconciliation. Labels: kind.
pub const RECONCILE_CHANGES_TOTAL: &str = "tripline_reconcile_changes_total";

/// Counter: per-entity failures during reconciliation.
pub const RECONCILE_FAILURES_TOTAL: &str = "tripline_reconcile_failures_total";

/// Histogram: reconciliation pass duration in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "tripline_reconcile_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tripline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tripline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tripline_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tripline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tripline_wal_flush_batch_size";

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
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::UpdateVehicle { .. } => "update_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::InsertDriver { .. } => "insert_driver",
        Command::UpdateDriver { .. } => "update_driver",
        Command::InsertRoute { .. } => "insert_route",
        Command::InsertPassenger { .. } => "insert_passenger",
        Command::InsertTrip { .. } => "insert_trip",
        Command::DeleteTrip { .. } => "delete_trip",
        Command::InsertBookings { .. } => "insert_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::SelectVehicles => "select_vehicles",
        Command::SelectDrivers { .. } => "select_drivers",
        Command::SelectTrips => "select_trips",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSeats { .. } => "select_seats",
        Command::SelectVehicleAvailability { .. } => "select_vehicle_availability",
        Command::SelectDriverAvailability { .. } => "select_driver_availability",
        Command::Reconcile => "reconcile",
    }
}
