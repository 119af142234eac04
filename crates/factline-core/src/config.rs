//! Configuration for the subscription delivery pipeline.
//!
//! All operational tuning values live here; nothing downstream hard-codes
//! timeouts, backoff or buffer sizes.

use std::time::Duration;

/// Configuration for a factline pipeline instance.
#[derive(Debug, Clone, Default)]
pub struct FactlineConfig {
    /// Notification channel settings.
    pub notification: NotificationConfig,
    /// Transforming consumer settings.
    pub transformation: TransformationConfig,
    /// Transformation cache settings.
    pub cache: CacheConfig,
}

/// Configuration for the [`NotificationChannel`](crate::channel::NotificationChannel).
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// How long one receive call blocks waiting for notifications.
    pub receive_timeout: Duration,
    /// How long a round-trip probe may take before the connection is
    /// declared unhealthy.
    pub roundtrip_timeout: Duration,
    /// Sleep between a connection failure and the next connect attempt.
    pub reconnect_backoff: Duration,
    /// How long `start()` waits for the first successful subscribe.
    pub startup_grace: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(10),
            roundtrip_timeout: Duration::from_millis(500),
            reconnect_backoff: Duration::from_secs(1),
            startup_grace: Duration::from_secs(15),
        }
    }
}

/// Configuration for the [`TransformingConsumer`](crate::transform::TransformingConsumer).
#[derive(Debug, Clone)]
pub struct TransformationConfig {
    /// Number of buffered facts that triggers an automatic flush.
    pub buffer_capacity: usize,
    /// Maximum wait for a single transformation while draining the buffer.
    pub flush_wait: Duration,
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            flush_wait: Duration::from_secs(30),
        }
    }
}

/// Configuration for transformation caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries held by the in-memory cache.
    pub max_entries: usize,
    /// Entries not accessed for this long are removed by compaction.
    pub retention: Duration,
    /// Interval between scheduled compactions.
    pub compaction_interval: Duration,
    /// Delay before the second invalidation after an `Updated` signal.
    pub invalidation_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000_000,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            compaction_interval: Duration::from_secs(60 * 60),
            invalidation_delay: Duration::from_secs(10),
        }
    }
}
