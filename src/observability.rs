use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "stayd_operations_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "stayd_operation_duration_seconds";

/// Counter: booking overlaps rejected. Labels: source (fast_path, storage).
pub const CONFLICTS_TOTAL: &str = "stayd_conflicts_total";

/// Counter: transactions committed with at least one write.
pub const TX_COMMITS_TOTAL: &str = "stayd_tx_commits_total";

/// Counter: transactions explicitly rolled back.
pub const TX_ROLLBACKS_TOTAL: &str = "stayd_tx_rollbacks_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: listings held in memory.
pub const LISTINGS_LOADED: &str = "stayd_listings_loaded";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayd_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "stayd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
