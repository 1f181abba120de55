use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::scheduler::store::TaskStore;

/// Periodically evict terminal tasks older than the retention window.
///
/// Only tasks with a `completed_at` are candidates; pending and running
/// tasks are never swept. Runs until the shutdown token fires.
pub async fn run(
    store: Arc<TaskStore>,
    retention_secs: u64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(retention_secs, "retention sweeper started");
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick; there is nothing to sweep at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = Utc::now() - chrono::Duration::seconds(retention_secs as i64);
                let swept = store.sweep(cutoff);
                if swept > 0 {
                    info!(swept, "cleaned up old tasks");
                }
            }
        }
    }
    debug!("retention sweeper stopped");
}
