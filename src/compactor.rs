use std::time::Duration;

use tracing::{info, warn};

use crate::store::MemoryStore;

/// How often the compactor looks at the WAL.
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Compact the WAL once it has grown by `threshold` commits. Returns whether
/// a compaction ran.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} commits");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically compacts the WAL.
pub async fn run_compactor(store: MemoryStore, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}
