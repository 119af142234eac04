//! Bounded in-memory transformation cache.
//!
//! O(1) slab-based LRU: an `FxHashMap<CacheKey, usize>` for key → slot
//! lookup and a `Vec<LruNode>` slab with intrusive doubly-linked list
//! pointers for recency order. All state sits behind one `parking_lot`
//! mutex held only for single-key operations; compaction copies the key
//! set first and then removes stale entries one lock acquisition at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::fact::Fact;
use crate::transform::TransformationKey;

use super::{CacheKey, TransformationCache};

/// Sentinel value for null pointers in the linked list.
const SENTINEL: usize = usize::MAX;

/// A slab node in the intrusive doubly-linked LRU list.
struct LruNode {
    key: Option<CacheKey>,
    fact: Option<Fact>,
    last_access: DateTime<Utc>,
    prev: usize,
    next: usize,
}

struct Lru {
    index: FxHashMap<CacheKey, usize>,
    slab: Vec<LruNode>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    max_entries: usize,
    evictions: u64,
}

impl Lru {
    fn new(max_entries: usize) -> Self {
        Self {
            index: FxHashMap::default(),
            slab: Vec::new(),
            free: Vec::new(),
            head: SENTINEL,
            tail: SENTINEL,
            max_entries: max_entries.max(1),
            evictions: 0,
        }
    }

    fn get(&mut self, key: &CacheKey, now: DateTime<Utc>) -> Option<Fact> {
        let &slot = self.index.get(key)?;
        self.detach(slot);
        self.push_front(slot);
        let node = &mut self.slab[slot];
        node.last_access = now;
        node.fact.clone()
    }

    fn insert(&mut self, key: CacheKey, fact: Fact, now: DateTime<Utc>) {
        if let Some(&slot) = self.index.get(&key) {
            let node = &mut self.slab[slot];
            node.fact = Some(fact);
            node.last_access = now;
            self.detach(slot);
            self.push_front(slot);
            return;
        }

        if self.index.len() >= self.max_entries {
            self.evict_tail();
        }

        let node = LruNode {
            key: Some(key.clone()),
            fact: Some(fact),
            last_access: now,
            prev: SENTINEL,
            next: SENTINEL,
        };
        let slot = if let Some(free_slot) = self.free.pop() {
            self.slab[free_slot] = node;
            free_slot
        } else {
            self.slab.push(node);
            self.slab.len() - 1
        };

        self.index.insert(key, slot);
        self.push_front(slot);
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.detach(slot);
        let node = &mut self.slab[slot];
        node.key = None;
        node.fact = None;
        self.free.push(slot);
        true
    }

    fn last_access(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.index.get(key).map(|&slot| self.slab[slot].last_access)
    }

    fn keys_matching(&self, mut pred: impl FnMut(&CacheKey, &Fact) -> bool) -> Vec<CacheKey> {
        self.index
            .iter()
            .filter(|(key, slot)| {
                self.slab[**slot]
                    .fact
                    .as_ref()
                    .is_some_and(|fact| pred(*key, fact))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    // -- linked-list operations --

    fn detach(&mut self, slot: usize) {
        let prev = self.slab[slot].prev;
        let next = self.slab[slot].next;

        if prev == SENTINEL {
            self.head = next;
        } else {
            self.slab[prev].next = next;
        }

        if next == SENTINEL {
            self.tail = prev;
        } else {
            self.slab[next].prev = prev;
        }

        self.slab[slot].prev = SENTINEL;
        self.slab[slot].next = SENTINEL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slab[slot].prev = SENTINEL;
        self.slab[slot].next = self.head;

        if self.head != SENTINEL {
            self.slab[self.head].prev = slot;
        }
        self.head = slot;

        if self.tail == SENTINEL {
            self.tail = slot;
        }
    }

    fn evict_tail(&mut self) {
        if self.tail == SENTINEL {
            return;
        }
        if let Some(key) = self.slab[self.tail].key.clone() {
            self.remove(&key);
            self.evictions += 1;
        }
    }
}

/// In-memory [`TransformationCache`] bounded to `max_entries`.
pub struct InMemoryTransformationCache {
    inner: Mutex<Lru>,
}

impl InMemoryTransformationCache {
    /// Creates a cache holding at most `max_entries` facts.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::new(max_entries)),
        }
    }

    /// Number of cached facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Total LRU evictions.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    fn remove_all(&self, keys: &[CacheKey]) -> usize {
        keys.iter().filter(|key| self.inner.lock().remove(key)).count()
    }
}

#[async_trait]
impl TransformationCache for InMemoryTransformationCache {
    async fn find(&self, key: &CacheKey) -> Option<Fact> {
        self.inner.lock().get(key, Utc::now())
    }

    async fn find_all(&self, keys: &[CacheKey]) -> FxHashMap<CacheKey, Fact> {
        let now = Utc::now();
        let mut lru = self.inner.lock();
        keys.iter()
            .filter_map(|key| lru.get(key, now).map(|fact| (key.clone(), fact)))
            .collect()
    }

    async fn put_all(&self, entries: Vec<(Fact, String)>) {
        let now = Utc::now();
        let mut lru = self.inner.lock();
        for (fact, chain_id) in entries {
            lru.insert(CacheKey::of(&fact, &chain_id), fact, now);
        }
    }

    async fn invalidate_fact(&self, fact_id: Uuid) {
        let keys = self
            .inner
            .lock()
            .keys_matching(|key, _| key.fact_id() == fact_id);
        let removed = self.remove_all(&keys);
        tracing::trace!(%fact_id, removed, "invalidated cached transformations");
    }

    async fn invalidate_for(&self, key: &TransformationKey) {
        let keys = self.inner.lock().keys_matching(|_, fact| {
            fact.ns() == key.ns && fact.type_() == Some(key.type_.as_str())
        });
        let removed = self.remove_all(&keys);
        tracing::debug!(key = %key, removed, "invalidated cached transformations");
    }

    async fn compact(&self, threshold: DateTime<Utc>) -> usize {
        let snapshot: Vec<CacheKey> = self.inner.lock().index.keys().cloned().collect();

        let mut removed = 0;
        for key in &snapshot {
            let mut lru = self.inner.lock();
            if lru.last_access(key).is_some_and(|at| at < threshold) && lru.remove(key) {
                removed += 1;
            }
        }
        removed
    }
}

impl std::fmt::Debug for InMemoryTransformationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lru = self.inner.lock();
        f.debug_struct("InMemoryTransformationCache")
            .field("len", &lru.index.len())
            .field("max_entries", &lru.max_entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fact(version: u32) -> Fact {
        Fact::builder()
            .ns("user")
            .type_("created")
            .version(version)
            .payload(r#"{"v":1}"#)
            .build()
    }

    #[tokio::test]
    async fn test_put_then_find() {
        let cache = InMemoryTransformationCache::new(10);
        let f = fact(2);
        cache.put(f.clone(), "chain").await;

        let found = cache.find(&CacheKey::new(f.id(), 2, "chain")).await;
        assert_eq!(found, Some(f.clone()));
        assert!(cache.find(&CacheKey::new(f.id(), 3, "chain")).await.is_none());
        assert!(cache.find(&CacheKey::new(f.id(), 2, "other")).await.is_none());
    }

    #[tokio::test]
    async fn test_find_all_returns_hits_only() {
        let cache = InMemoryTransformationCache::new(10);
        let a = fact(2);
        let b = fact(2);
        cache
            .put_all(vec![(a.clone(), "c".into()), (b.clone(), "c".into())])
            .await;

        let missing = CacheKey::new(Uuid::new_v4(), 2, "c");
        let keys = vec![CacheKey::of(&a, "c"), missing.clone(), CacheKey::of(&b, "c")];
        let found = cache.find_all(&keys).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found.get(&CacheKey::of(&a, "c")), Some(&a));
        assert!(!found.contains_key(&missing));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = InMemoryTransformationCache::new(2);
        let a = fact(1);
        let b = fact(1);
        let c = fact(1);
        cache.put(a.clone(), "x").await;
        cache.put(b.clone(), "x").await;
        // Touch a so b is least recently used.
        assert!(cache.find(&CacheKey::of(&a, "x")).await.is_some());
        cache.put(c.clone(), "x").await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
        assert!(cache.find(&CacheKey::of(&a, "x")).await.is_some());
        assert!(cache.find(&CacheKey::of(&b, "x")).await.is_none());
        assert!(cache.find(&CacheKey::of(&c, "x")).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_fact_and_key() {
        let cache = InMemoryTransformationCache::new(10);
        let a = fact(2);
        let other = Fact::builder().ns("order").type_("placed").version(2).build();
        cache.put(a.clone(), "c1").await;
        cache.put(a.clone(), "c2").await;
        cache.put(other.clone(), "c1").await;

        cache.invalidate_fact(a.id()).await;
        assert_eq!(cache.len(), 1);

        cache.put(a.clone(), "c1").await;
        cache
            .invalidate_for(&TransformationKey::new("order", "placed"))
            .await;
        assert_eq!(cache.len(), 1);
        assert!(cache.find(&CacheKey::of(&a, "c1")).await.is_some());
    }

    #[tokio::test]
    async fn test_compact_by_last_access() {
        let cache = InMemoryTransformationCache::new(10);
        cache.put(fact(1), "c").await;
        cache.put(fact(1), "c").await;

        assert_eq!(cache.compact(Utc::now() - Duration::hours(1)).await, 0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.compact(Utc::now() + Duration::seconds(1)).await, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_slot_reuse_after_remove() {
        let cache = InMemoryTransformationCache::new(3);
        let facts: Vec<Fact> = (0..3).map(|_| fact(1)).collect();
        for f in &facts {
            cache.put(f.clone(), "c").await;
        }
        cache.invalidate_fact(facts[1].id()).await;
        let again = fact(1);
        cache.put(again.clone(), "c").await;
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evictions(), 0);
        for f in [&facts[0], &facts[2], &again] {
            assert!(cache.find(&CacheKey::of(f, "c")).await.is_some());
        }
    }
}
