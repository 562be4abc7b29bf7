use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "berth_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "berth_query_duration_seconds";

/// Counter: allocation admission decisions. Labels: severity.
pub const ALLOCATION_DECISIONS_TOTAL: &str = "berth_allocation_decisions_total";

/// Counter: read-only conflict checks. Labels: severity.
pub const CONFLICT_CHECKS_TOTAL: &str = "berth_conflict_checks_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "berth_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "berth_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "berth_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "berth_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "berth_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "berth_wal_flush_batch_size";

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
        Command::InsertCategory { .. } => "insert_category",
        Command::UpdateCategory { .. } => "update_category",
        Command::DeleteCategory { .. } => "delete_category",
        Command::SelectCategories => "select_categories",
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::InsertProject { .. } => "insert_project",
        Command::UpdateProject { .. } => "update_project",
        Command::DeleteProject { .. } => "delete_project",
        Command::SelectProjects { .. } => "select_projects",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::SelectUsers => "select_users",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::UpdateAllocation { .. } => "update_allocation",
        Command::CancelAllocation { .. } => "cancel_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::CheckConflict { .. } => "check_conflict",
        Command::InsertMaintenance { .. } => "insert_maintenance",
        Command::UpdateMaintenance { .. } => "update_maintenance",
        Command::DeleteMaintenance { .. } => "delete_maintenance",
        Command::SelectMaintenance { .. } => "select_maintenance",
        Command::SelectSchedule { .. } => "select_schedule",
    }
}
