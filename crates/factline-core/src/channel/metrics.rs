//! Notification channel counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one [`NotificationChannel`](super::NotificationChannel).
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Successful connections (initial and reconnects).
    pub connections: AtomicU64,

    /// Connection attempts or sessions that ended in an error.
    pub connection_errors: AtomicU64,

    /// Non-empty notification batches received.
    pub batches_received: AtomicU64,

    /// Raw notifications received, including health-check echoes.
    pub notifications_received: AtomicU64,

    /// Notifications that could not be decoded.
    pub notifications_dropped: AtomicU64,

    /// Signals published on the change bus after compaction.
    pub signals_published: AtomicU64,

    /// Health-check probes sent.
    pub health_checks: AtomicU64,

    /// Health-check probes not echoed in time.
    pub failed_health_checks: AtomicU64,
}

impl ChannelMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, notifications: usize, dropped: usize) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        self.notifications_received
            .fetch_add(notifications as u64, Ordering::Relaxed);
        self.notifications_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self, signals: usize) {
        self.signals_published
            .fetch_add(signals as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_health_check(&self, ok: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_health_checks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns `(connections, connection_errors, signals_published)`.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.connections.load(Ordering::Relaxed),
            self.connection_errors.load(Ordering::Relaxed),
            self.signals_published.load(Ordering::Relaxed),
        )
    }
}
