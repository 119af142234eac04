//! Scheduled cache compaction.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CacheConfig;

use super::TransformationCache;

/// Spawns a task that removes entries not accessed within
/// `config.retention`, every `config.compaction_interval`, until `shutdown`
/// becomes `true` or its sender is dropped.
///
/// The first pass runs immediately.
pub fn spawn_compaction(
    cache: Arc<dyn TransformationCache>,
    config: &CacheConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let retention = config.retention;
    let mut ticker = tokio::time::interval(config.compaction_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let threshold = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|keep| Utc::now().checked_sub_signed(keep));
            let Some(threshold) = threshold else {
                tracing::warn!(?retention, "cache retention out of range, skipping compaction");
                continue;
            };

            let removed = cache.compact(threshold).await;
            tracing::debug!(removed, %threshold, "transformation cache compacted");
        }
        tracing::debug!("cache compaction stopped");
    })
}
