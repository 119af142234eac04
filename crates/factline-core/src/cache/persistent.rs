//! Cache front over a durable [`TransformationStore`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use uuid::Uuid;

use crate::fact::Fact;
use crate::transform::TransformationKey;

use super::{CacheKey, TransformationCache, TransformationStore};

/// Durable [`TransformationCache`].
///
/// Single lookups refresh `last_access` inline. Batch lookups return what
/// was found immediately and refresh timestamps in a spawned task, so a
/// batch hit's timestamp may lag; that only affects compaction order.
/// Store failures are logged and surface as misses.
pub struct PersistentTransformationCache {
    store: Arc<dyn TransformationStore>,
}

impl PersistentTransformationCache {
    /// Creates a cache over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TransformationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TransformationCache for PersistentTransformationCache {
    async fn find(&self, key: &CacheKey) -> Option<Fact> {
        let fact = match self.store.find(key).await {
            Ok(found) => found?,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                return None;
            }
        };

        if let Err(e) = self.store.touch(std::slice::from_ref(key), Utc::now()).await {
            tracing::warn!(key = %key, error = %e, "failed to refresh cache access time");
        }
        Some(fact)
    }

    async fn find_all(&self, keys: &[CacheKey]) -> FxHashMap<CacheKey, Fact> {
        if keys.is_empty() {
            return FxHashMap::default();
        }
        let found = match self.store.find_all(keys).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    keys = keys.len(),
                    error = %e,
                    "batch cache lookup failed, treating as misses"
                );
                return FxHashMap::default();
            }
        };

        if !found.is_empty() {
            let hits: Vec<CacheKey> = found.iter().map(|(key, _)| key.clone()).collect();
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(e) = store.touch(&hits, Utc::now()).await {
                    tracing::warn!(
                        keys = hits.len(),
                        error = %e,
                        "failed to refresh cache access times"
                    );
                }
            });
        }

        found.into_iter().collect()
    }

    async fn put_all(&self, entries: Vec<(Fact, String)>) {
        if entries.is_empty() {
            return;
        }
        let rows: Vec<(CacheKey, Fact)> = entries
            .into_iter()
            .map(|(fact, chain_id)| (CacheKey::of(&fact, &chain_id), fact))
            .collect();
        if let Err(e) = self.store.upsert(&rows, Utc::now()).await {
            tracing::warn!(entries = rows.len(), error = %e, "cache write failed");
        }
    }

    async fn invalidate_fact(&self, fact_id: Uuid) {
        match self.store.delete_for_fact(fact_id).await {
            Ok(removed) => tracing::trace!(%fact_id, removed, "invalidated cached transformations"),
            Err(e) => tracing::warn!(%fact_id, error = %e, "cache invalidation failed"),
        }
    }

    async fn invalidate_for(&self, key: &TransformationKey) {
        match self.store.delete_for_key(key).await {
            Ok(removed) => tracing::debug!(key = %key, removed, "invalidated cached transformations"),
            Err(e) => tracing::warn!(key = %key, error = %e, "cache invalidation failed"),
        }
    }

    async fn compact(&self, threshold: DateTime<Utc>) -> usize {
        match self.store.delete_older_than(threshold).await {
            Ok(removed) => usize::try_from(removed).unwrap_or(usize::MAX),
            Err(e) => {
                tracing::warn!(%threshold, error = %e, "cache compaction failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for PersistentTransformationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTransformationCache")
            .finish_non_exhaustive()
    }
}
