//! # `factline` Core
//!
//! The subscription delivery pipeline of the `factline` event-fact store.
//!
//! This crate provides:
//! - **Notification channel**: one long-lived listener on the backing store's
//!   publish/subscribe primitive, republishing compacted [`ChangeSignal`]s
//! - **Change bus**: in-process typed pub/sub for those signals
//! - **Blacklist**: process-local deny-list of fact ids, refreshed on signal
//! - **Fact filter**: per-subscription OR-of-ANDs predicate over facts
//! - **Transformations**: chain resolution, two-tier caching and the
//!   direct/buffering transforming consumer
//!
//! ## Data Flow
//!
//! ```text
//!  store pub/sub ──► NotificationChannel ──► ChangeBus ──┬─► Blacklist::refresh
//!                                                        ├─► cache invalidation
//!                                                        └─► registry invalidation
//!
//!  catchup / live query ──► FactFilter ──► TransformingConsumer ──► subscriber
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use factline_core::filter::FactFilter;
//! use factline_core::transform::TransformingConsumer;
//!
//! let filter = FactFilter::new(&specs, blacklist, &scripts)?;
//! let mut consumer = TransformingConsumer::new(transformer, &specs, downstream, config);
//!
//! for fact in candidates {
//!     if filter.test(&fact)? {
//!         consumer.accept(Some(fact)).await?;
//!     }
//! }
//! consumer.accept(None).await?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod blacklist;
pub mod cache;
pub mod channel;
pub mod config;
pub mod fact;
pub mod filter;
pub mod invalidation;
pub mod script;
pub mod signal;
pub mod testing;
pub mod transform;

// Re-export key types
pub use config::FactlineConfig;
pub use fact::{Fact, FactHeader, FactSpec, FilterScript};
pub use signal::{ChangeBus, ChangeSignal, SignalKind};

/// Result type for factline-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for factline-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Notification channel errors
    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    /// Fact filter errors
    #[error("Filter error: {0}")]
    Filter(#[from] filter::FilterError),

    /// Transformation errors
    #[error("Transformation error: {0}")]
    Transformation(#[from] transform::TransformationError),

    /// Registry and blacklist source errors
    #[error("Registry error: {0}")]
    Registry(#[from] transform::RegistryError),

    /// Durable cache store errors
    #[error("Store error: {0}")]
    Store(#[from] cache::StoreError),

    /// Fact decoding errors
    #[error("Fact error: {0}")]
    Fact(#[from] fact::FactError),
}
