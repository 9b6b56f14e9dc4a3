use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use stayd::config::Config;
use stayd::engine::Engine;
use stayd::seed::{self, SeedPlan};
use stayd::store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    stayd::observability::init(config.metrics_port)
        .context("failed to install Prometheus metrics exporter")?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let wal_path = config.wal_path();
    let store = MemoryStore::open(wal_path.clone())
        .with_context(|| format!("failed to open WAL {}", wal_path.display()))?;
    let engine = Engine::new(Arc::new(store.clone())).with_op_timeout(config.op_timeout);

    info!("stayd started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  listings: {}", store.listing_count());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  op_timeout: {}",
        config.op_timeout.map_or("none".to_string(), |d| format!("{}ms", d.as_millis()))
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    if config.seed_listings > 0 && store.listing_count() == 0 {
        let plan = SeedPlan::new(
            config.seed_listings,
            config.seed_bookings_per_listing,
            config.seed,
        );
        let report = seed::seed(&engine, &plan).await.context("seeding failed")?;
        info!(
            "seeded {} listings, {} bookings, {} payments (seed {})",
            report.listings, report.bookings, report.payments, config.seed
        );
    }

    let compactor = tokio::spawn(stayd::compactor::run_compactor(
        store.clone(),
        config.compact_threshold,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("shutdown signal received");

    compactor.abort();
    if let Err(e) = store.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("stayd stopped");
    Ok(())
}
