use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotledger_query_duration_seconds";

/// Counter: provider webhooks received. Labels: outcome.
pub const WEBHOOKS_TOTAL: &str = "slotledger_webhooks_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings refused because the slot overlaps an active appointment.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotledger_booking_conflicts_total";

/// Counter: payout requests accepted.
pub const PAYOUTS_REQUESTED_TOTAL: &str = "slotledger_payouts_requested_total";

/// Counter: provider dispatches that failed or timed out. Labels: provider.
pub const PAYOUT_DISPATCH_FAILURES_TOTAL: &str = "slotledger_payout_dispatch_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotledger_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotledger_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotledger_wal_flush_batch_size";

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
        Command::SelectBusinessUnit => "select_business_unit",
        Command::UpdateBusinessUnit { .. } => "update_business_unit",
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::DeleteService { .. } => "delete_service",
        Command::SelectServices { .. } => "select_services",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::SetAppointmentStatus { .. } => "set_appointment_status",
        Command::SetPaymentStatus { .. } => "set_payment_status",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::InsertPayout { .. } => "insert_payout",
        Command::SelectPayouts => "select_payouts",
        Command::SelectBalance => "select_balance",
        Command::SelectSummary => "select_summary",
    }
}
