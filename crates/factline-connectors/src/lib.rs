//! # `factline` Connectors
//!
//! Backing-store adapters for the `factline` subscription pipeline.
//!
//! The core crate talks to its store only through traits; this crate
//! implements them:
//!
//! - [`postgres::PgPubSubConnector`] - `PubSubConnector` over `LISTEN`/`NOTIFY`
//! - [`postgres::PgTransformationStore`] - durable `TransformationStore`
//! - [`postgres::PgBlacklistSource`] - `BlacklistSource`
//!
//! The adapters are behind the `postgres` feature. Configuration parsing
//! and SQL text are always compiled.
//!
//! ## Wiring
//!
//! ```rust,ignore
//! let pg = PostgresConfig::from_config(&config)?;
//! let (client, _driver) = postgres::connect(&pg).await?;
//! let client = Arc::new(client);
//!
//! let store = Arc::new(PgTransformationStore::new(Arc::clone(&client), &pg));
//! let cache = Arc::new(PersistentTransformationCache::new(store));
//! let blacklist = Arc::new(Blacklist::new(Arc::new(PgBlacklistSource::new(client, &pg))));
//! let channel = NotificationChannel::new(
//!     Arc::new(PgPubSubConnector::new(pg)),
//!     bus,
//!     settings.notification,
//! );
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Connector error types.
pub mod error;

/// Key-value connector configuration.
pub mod config;

/// `PostgreSQL` adapters.
pub mod postgres;

pub use config::ConnectorConfig;
pub use error::ConnectorError;
