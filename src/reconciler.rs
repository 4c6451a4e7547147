use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::Engine;

/// How often the compactor checks the WAL append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic status reconciliation. The first pass runs immediately so statuses are
/// current right after startup. A failed pass never stops the loop.
pub async fn run_reconciler(engine: Arc<Engine>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("reconciler stopped");
                return;
            }
            _ = interval.tick() => {
                let report = engine.run_reconciliation().await;
                if report.failures > 0 {
                    error!("reconciliation pass finished with {} failures", report.failures);
                }
            }
        }
    }
}

/// Rewrite the WAL once `threshold` appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                if engine.wal_appends_since_compact().await < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!("WAL compacted"),
                    Err(e) => error!("WAL compaction failed: {e}"),
                }
            }
        }
    }
}
