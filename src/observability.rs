use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "ridehold_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "ridehold_query_duration_seconds";

// ── Reservation outcomes ────────────────────────────────────────

/// Counter: holds granted.
pub const HOLDS_PLACED_TOTAL: &str = "ridehold_holds_placed_total";

/// Counter: hold attempts refused because the slot was taken.
pub const HOLD_CONFLICTS_TOTAL: &str = "ridehold_hold_conflicts_total";

/// Counter: finalize attempts that found no live hold.
pub const HOLDS_LOST_TOTAL: &str = "ridehold_holds_lost_total";

/// Counter: expired holds physically removed by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "ridehold_holds_reaped_total";

/// Counter: holds promoted to bookings.
pub const BOOKINGS_FINALIZED_TOTAL: &str = "ridehold_bookings_finalized_total";

/// Counter: availability answers computed without one of their sources. Labels: source.
pub const AVAILABILITY_DEGRADED_TOTAL: &str = "ridehold_availability_degraded_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "ridehold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "ridehold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "ridehold_connections_rejected_total";

/// Gauge: (ride, date) shards held in memory.
pub const DAYS_ACTIVE: &str = "ridehold_days_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "ridehold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "ridehold_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "ridehold_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRide { .. } => "insert_ride",
        Command::SelectRides => "select_rides",
        Command::InsertHold { .. } => "insert_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertBookingRecord { .. } => "insert_booking_record",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
    }
}
