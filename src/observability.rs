use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reports generated. Labels: status.
pub const REPORTS_TOTAL: &str = "loanstat_reports_total";

/// Histogram: end-to-end report generation latency in seconds.
pub const REPORT_DURATION_SECONDS: &str = "loanstat_report_duration_seconds";

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "loanstat_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "loanstat_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "loanstat_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "loanstat_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "loanstat_connections_rejected_total";

/// Counter: transaction log reloads.
pub const STORE_RELOADS_TOTAL: &str = "loanstat_store_reloads_total";

/// Gauge: transactions in the current store snapshot.
pub const STORE_TRANSACTIONS: &str = "loanstat_store_transactions";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::SelectSummary => "select_summary",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectMostBorrowed => "select_most_borrowed",
        Command::SelectLeastBorrowed => "select_least_borrowed",
        Command::SelectRunOutFrequency { .. } => "select_run_out_frequency",
        Command::SelectRecentTransactions { .. } => "select_recent_transactions",
        Command::SelectReport { .. } => "select_report",
    }
}
