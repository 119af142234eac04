//! Cache and registry invalidation driven by change signals.
//!
//! - `Updated { fact_id }`: the fact's cached transformations are dropped
//!   immediately and again after `invalidation_delay`. The second pass
//!   removes entries written by a transformation that was already in
//!   flight when the first pass ran.
//! - `TransformationSetChanged { ns, type }`: the registry forgets its
//!   steps for the key and every cached transformation for the key is
//!   dropped.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::TransformationCache;
use crate::config::CacheConfig;
use crate::signal::{ChangeBus, ChangeSignal, SignalKind};
use crate::transform::{TransformationKey, TransformationRegistry};

/// Registers the invalidation handlers on `bus`.
///
/// Must be called from within a tokio runtime; invalidations run as tasks
/// spawned on that runtime.
pub fn register_invalidation(
    bus: &dyn ChangeBus,
    cache: Arc<dyn TransformationCache>,
    registry: Arc<dyn TransformationRegistry>,
    config: &CacheConfig,
) {
    let runtime = tokio::runtime::Handle::current();
    let delay = config.invalidation_delay;

    {
        let cache = Arc::clone(&cache);
        let runtime = runtime.clone();
        bus.subscribe(
            SignalKind::Updated,
            Arc::new(move |signal: &ChangeSignal| {
                if let ChangeSignal::Updated { fact_id } = signal {
                    runtime.spawn(invalidate_twice(Arc::clone(&cache), *fact_id, delay));
                }
            }),
        );
    }

    bus.subscribe(
        SignalKind::TransformationSetChanged,
        Arc::new(move |signal: &ChangeSignal| {
            if let ChangeSignal::TransformationSetChanged { ns, type_ } = signal {
                let key = TransformationKey::new(ns.clone(), type_.clone());
                registry.invalidate(&key);
                let cache = Arc::clone(&cache);
                runtime.spawn(async move {
                    cache.invalidate_for(&key).await;
                    tracing::debug!(key = %key, "transformation set changed, cache invalidated");
                });
            }
        }),
    );
}

async fn invalidate_twice(cache: Arc<dyn TransformationCache>, fact_id: uuid::Uuid, delay: Duration) {
    cache.invalidate_fact(fact_id).await;
    tokio::time::sleep(delay).await;
    cache.invalidate_fact(fact_id).await;
    tracing::trace!(%fact_id, "updated fact invalidated twice");
}
