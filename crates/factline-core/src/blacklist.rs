//! Process-local deny-list of fact ids.
//!
//! [`Blacklist`] answers `is_blocked` from an in-memory set and reconciles
//! that set against a [`BlacklistSource`] on every `BlacklistChanged`
//! signal. Reconciliation never swaps the set: newly blocked ids are added
//! first, then ids no longer blocked are removed, each pass under a short
//! write lock, so a concurrent reader only ever sees a state that is at
//! least as strict as either the old or the new set.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashSet;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::signal::{ChangeBus, ChangeSignal, SignalKind};
use crate::transform::RegistryError;

/// Authoritative source of blocked fact ids.
#[async_trait]
pub trait BlacklistSource: Send + Sync {
    /// Fetches the complete current set of blocked ids.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the store cannot be read.
    async fn blocked_ids(&self) -> Result<HashSet<Uuid>, RegistryError>;
}

/// Outcome of one [`Blacklist::refresh`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Ids newly blocked.
    pub added: usize,
    /// Ids no longer blocked.
    pub removed: usize,
}

/// Thread-safe set of fact ids that must never be delivered.
pub struct Blacklist {
    ids: RwLock<FxHashSet<Uuid>>,
    source: Arc<dyn BlacklistSource>,
    /// Serializes refreshes so two reconciliations never interleave.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Blacklist {
    /// Creates an empty blacklist over `source`. Call [`Blacklist::refresh`]
    /// or [`Blacklist::start`] to populate it.
    #[must_use]
    pub fn new(source: Arc<dyn BlacklistSource>) -> Self {
        Self {
            ids: RwLock::new(FxHashSet::default()),
            source,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns `true` if the id is blocked.
    #[inline]
    #[must_use]
    pub fn is_blocked(&self, id: Uuid) -> bool {
        self.ids.read().contains(&id)
    }

    /// Number of blocked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    /// Returns `true` if nothing is blocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Reconciles the local set with the source.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the source cannot be read; the local set
    /// is left unchanged in that case.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RegistryError> {
        let _guard = self.refresh_lock.lock().await;
        let fresh = self.source.blocked_ids().await?;

        let added = {
            let mut ids = self.ids.write();
            let before = ids.len();
            ids.extend(fresh.iter().copied());
            ids.len() - before
        };

        let removed = {
            let mut ids = self.ids.write();
            let before = ids.len();
            ids.retain(|id| fresh.contains(id));
            before - ids.len()
        };

        if added > 0 || removed > 0 {
            tracing::debug!(added, removed, total = fresh.len(), "blacklist refreshed");
        }
        Ok(RefreshOutcome { added, removed })
    }

    /// Populates the blacklist once and subscribes it to
    /// `BlacklistChanged` signals.
    ///
    /// Must be called from within a tokio runtime; refreshes triggered by
    /// the bus run as spawned tasks on that runtime.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the initial refresh fails. The
    /// subscription is registered regardless.
    pub async fn start(self: &Arc<Self>, bus: &dyn ChangeBus) -> Result<(), RegistryError> {
        let runtime = tokio::runtime::Handle::current();
        let blacklist = Arc::clone(self);
        bus.subscribe(
            SignalKind::BlacklistChanged,
            Arc::new(move |_: &ChangeSignal| {
                let blacklist = Arc::clone(&blacklist);
                runtime.spawn(async move {
                    if let Err(e) = blacklist.refresh().await {
                        tracing::warn!(error = %e, "blacklist refresh failed");
                    }
                });
            }),
        );

        self.refresh().await.map(|_| ())
    }
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("blocked", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{ChangeSignal, LocalChangeBus};
    use crate::testing::StaticBlacklistSource;
    use std::time::Duration;

    #[tokio::test]
    async fn test_refresh_adds_and_removes() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let source = Arc::new(StaticBlacklistSource::new([a, b]));
        let blacklist = Blacklist::new(Arc::clone(&source) as Arc<dyn BlacklistSource>);

        let outcome = blacklist.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome { added: 2, removed: 0 });
        assert!(blacklist.is_blocked(a));
        assert!(blacklist.is_blocked(b));
        assert!(!blacklist.is_blocked(c));

        source.set([b, c]);
        let outcome = blacklist.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome { added: 1, removed: 1 });
        assert!(!blacklist.is_blocked(a));
        assert!(blacklist.is_blocked(b));
        assert!(blacklist.is_blocked(c));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
        let probe = Uuid::new_v4();
        let source = Arc::new(StaticBlacklistSource::new(ids.iter().copied()));
        let blacklist = Blacklist::new(source);

        blacklist.refresh().await.unwrap();
        let before: Vec<bool> = ids.iter().map(|id| blacklist.is_blocked(*id)).collect();

        let outcome = blacklist.refresh().await.unwrap();
        let after: Vec<bool> = ids.iter().map(|id| blacklist.is_blocked(*id)).collect();

        assert_eq!(outcome, RefreshOutcome::default());
        assert_eq!(before, after);
        assert!(!blacklist.is_blocked(probe));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_state() {
        let a = Uuid::new_v4();
        let source = Arc::new(StaticBlacklistSource::new([a]));
        let blacklist = Blacklist::new(Arc::clone(&source) as Arc<dyn BlacklistSource>);
        blacklist.refresh().await.unwrap();

        source.fail_next("store unavailable");
        assert!(blacklist.refresh().await.is_err());
        assert!(blacklist.is_blocked(a));
    }

    #[tokio::test]
    async fn test_start_subscribes_to_bus() {
        let a = Uuid::new_v4();
        let source = Arc::new(StaticBlacklistSource::new(Vec::<Uuid>::new()));
        let blacklist = Arc::new(Blacklist::new(
            Arc::clone(&source) as Arc<dyn BlacklistSource>
        ));
        let bus = LocalChangeBus::new();

        blacklist.start(&bus).await.unwrap();
        assert!(blacklist.is_empty());

        source.set([a]);
        bus.publish(ChangeSignal::BlacklistChanged);

        for _ in 0..100 {
            if blacklist.is_blocked(a) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(blacklist.is_blocked(a));
    }
}
