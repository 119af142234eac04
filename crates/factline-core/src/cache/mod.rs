//! # Transformation Cache
//!
//! Avoids re-running transformation scripts for facts already transformed
//! for a given `(fact id, target version, chain id)` triple.
//!
//! Two interchangeable implementations of [`TransformationCache`]:
//!
//! - [`InMemoryTransformationCache`]: bounded LRU, no I/O
//! - [`PersistentTransformationCache`]: front over a durable
//!   [`TransformationStore`]; batch lookups refresh access timestamps in
//!   the background
//!
//! Both treat backing-store failures as misses (reads) or best-effort
//! (writes): errors are logged, never returned.
//!
//! [`spawn_compaction`] runs `compact(now - retention)` on a schedule.

mod compaction;
mod memory;
mod persistent;

pub use compaction::spawn_compaction;
pub use memory::InMemoryTransformationCache;
pub use persistent::PersistentTransformationCache;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use uuid::Uuid;

use crate::fact::Fact;
use crate::transform::TransformationKey;

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of a cached transformed fact.
///
/// Renders as `<fact id>-<version>-<chain id>`, the durable key shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    fact_id: Uuid,
    version: u32,
    chain_id: String,
}

impl CacheKey {
    /// Creates a key for `fact_id` transformed to `version` via `chain_id`.
    #[must_use]
    pub fn new(fact_id: Uuid, version: u32, chain_id: impl Into<String>) -> Self {
        Self {
            fact_id,
            version,
            chain_id: chain_id.into(),
        }
    }

    /// Key under which an already transformed `fact` is stored.
    #[must_use]
    pub fn of(fact: &Fact, chain_id: &str) -> Self {
        Self::new(fact.id(), fact.version(), chain_id)
    }

    /// Returns the fact id.
    #[must_use]
    pub fn fact_id(&self) -> Uuid {
        self.fact_id
    }

    /// Returns the target version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the chain id.
    #[must_use]
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Prefix shared by every key of one fact.
    #[must_use]
    pub fn fact_prefix(fact_id: Uuid) -> String {
        format!("{fact_id}-")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.fact_id, self.version, self.chain_id)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Cache of transformed facts.
#[async_trait]
pub trait TransformationCache: Send + Sync {
    /// Looks up one entry, refreshing its access time on hit.
    async fn find(&self, key: &CacheKey) -> Option<Fact>;

    /// Looks up many entries in one round trip. Missing keys are absent
    /// from the result.
    async fn find_all(&self, keys: &[CacheKey]) -> FxHashMap<CacheKey, Fact>;

    /// Stores a transformed fact produced by chain `chain_id`.
    async fn put(&self, fact: Fact, chain_id: &str) {
        self.put_all(vec![(fact, chain_id.to_string())]).await;
    }

    /// Stores many transformed facts.
    async fn put_all(&self, entries: Vec<(Fact, String)>);

    /// Drops every entry derived from one fact.
    async fn invalidate_fact(&self, fact_id: Uuid);

    /// Drops every entry for facts with the given coordinates.
    async fn invalidate_for(&self, key: &TransformationKey);

    /// Removes entries last accessed before `threshold`; returns how many.
    async fn compact(&self, threshold: DateTime<Utc>) -> usize;
}

/// Errors raised by a durable [`TransformationStore`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A statement failed.
    #[error("store query failed: {0}")]
    Query(String),

    /// A stored row could not be decoded.
    #[error("corrupt cache entry {key}: {message}")]
    Corrupt {
        /// Rendered cache key.
        key: String,
        /// Decoder message.
        message: String,
    },
}

/// Durable storage behind [`PersistentTransformationCache`].
///
/// Rows are `(cache_key, header, payload, last_access)`.
#[async_trait]
pub trait TransformationStore: Send + Sync {
    /// Reads one row without touching it.
    async fn find(&self, key: &CacheKey) -> Result<Option<Fact>, StoreError>;

    /// Reads many rows without touching them.
    async fn find_all(&self, keys: &[CacheKey]) -> Result<Vec<(CacheKey, Fact)>, StoreError>;

    /// Sets `last_access` of the given rows.
    async fn touch(&self, keys: &[CacheKey], at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Inserts or replaces rows, stamping them with `at`.
    async fn upsert(&self, entries: &[(CacheKey, Fact)], at: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Deletes rows of one fact; returns how many.
    async fn delete_for_fact(&self, fact_id: Uuid) -> Result<u64, StoreError>;

    /// Deletes rows whose header has the given coordinates.
    async fn delete_for_key(&self, key: &TransformationKey) -> Result<u64, StoreError>;

    /// Deletes rows last accessed before `threshold`.
    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rendering() {
        let id = Uuid::new_v4();
        let key = CacheKey::new(id, 3, "abc");
        assert_eq!(key.to_string(), format!("{id}-3-abc"));
        assert!(key.to_string().starts_with(&CacheKey::fact_prefix(id)));
    }

    #[test]
    fn test_key_of_fact() {
        let fact = Fact::builder().ns("n").type_("t").version(2).build();
        let key = CacheKey::of(&fact, "chain");
        assert_eq!(key.fact_id(), fact.id());
        assert_eq!(key.version(), 2);
        assert_eq!(key.chain_id(), "chain");
    }
}
