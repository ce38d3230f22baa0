use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "appointd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "appointd_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (created, rescheduled, or an
/// error kind).
pub const BOOKINGS_TOTAL: &str = "appointd_bookings_total";

/// Counter: rejected windows. Labels: source (appointment, exception).
pub const CONFLICTS_TOTAL: &str = "appointd_conflicts_total";

/// Counter: lifecycle transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "appointd_transitions_total";

/// Counter: signals published. Labels: kind.
pub const SIGNALS_TOTAL: &str = "appointd_signals_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "appointd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "appointd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "appointd_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "appointd_tenants_active";

/// Histogram: seconds spent waiting for staff schedule locks.
pub const LOCK_WAIT_SECONDS: &str = "appointd_lock_wait_seconds";

/// Counter: lock acquisitions that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "appointd_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "appointd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "appointd_wal_flush_batch_size";

/// Counter: WAL compactions.
pub const COMPACTIONS_TOTAL: &str = "appointd_compactions_total";

/// Histogram: completion sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "appointd_sweep_duration_seconds";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertException { .. } => "insert_exception",
        Command::DeleteException { .. } => "delete_exception",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::Call(call) => call.name(),
        Command::SelectStaff => "select_staff",
        Command::SelectServices => "select_services",
        Command::SelectExceptions { .. } => "select_exceptions",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectCompletions { .. } => "select_completions",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectUnavailability { .. } => "select_unavailability",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
