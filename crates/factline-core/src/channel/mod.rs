//! # Notification Channel
//!
//! One long-lived listener on the backing store's publish/subscribe
//! primitive. Raw notifications are decoded into [`ChangeSignal`]s,
//! compacted per batch and republished on the [`ChangeBus`].
//!
//! ## Connection Lifecycle
//!
//! ```text
//!  connect ─► subscribe(all channels) ─► publish catch-up signals
//!     ▲                                        │
//!     │                                        ▼
//!  backoff ◄── error / missed round-trip ◄── receive(timeout)
//!                                              │ empty
//!                                              ▼
//!                                   notify(roundtrip), await echo
//! ```
//!
//! Connection loss is never fatal: the listener reconnects forever after
//! `reconnect_backoff`, re-emitting catch-up signals each time so
//! subscribers re-query anything missed while disconnected.
//!
//! [`ChangeSignal`]: crate::signal::ChangeSignal
//! [`ChangeBus`]: crate::signal::ChangeBus

mod compaction;
mod listener;
mod metrics;
mod pubsub;

pub use compaction::compact;
pub use listener::NotificationChannel;
pub use metrics::ChannelMetrics;
pub use pubsub::{PubSubConnection, PubSubConnector};

/// Errors raised by the notification channel and pub/sub connections.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Connecting to the store failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// An established connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The round-trip probe was not echoed in time.
    #[error("health check failed: no round-trip echo within {0:?}")]
    HealthCheck(std::time::Duration),

    /// The connection was closed.
    #[error("connection closed")]
    Closed,

    /// The channel is already running.
    #[error("notification channel already started")]
    AlreadyStarted,
}
