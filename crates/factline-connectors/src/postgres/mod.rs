//! `PostgreSQL` adapters.
//!
//! - [`PgPubSubConnector`]: `LISTEN`/`pg_notify` publish/subscribe
//! - [`PgTransformationStore`]: durable transformation cache table
//! - [`PgBlacklistSource`]: blacklist table
//!
//! Configuration and SQL text are always available; the adapters need the
//! `postgres` feature.
//!
//! ## Tables
//!
//! ```sql
//! CREATE TABLE transformationcache (
//!     cache_key   TEXT PRIMARY KEY,
//!     header      JSONB NOT NULL,
//!     payload     BYTEA NOT NULL,
//!     last_access TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE blacklist (id UUID PRIMARY KEY);
//! ```

mod config;
pub mod sql;

#[cfg(feature = "postgres")]
mod blacklist;
#[cfg(feature = "postgres")]
mod connection;
#[cfg(feature = "postgres")]
mod pubsub;
#[cfg(feature = "postgres")]
mod store;

pub use config::PostgresConfig;

#[cfg(feature = "postgres")]
pub use blacklist::PgBlacklistSource;
#[cfg(feature = "postgres")]
pub use connection::connect;
#[cfg(feature = "postgres")]
pub use pubsub::PgPubSubConnector;
#[cfg(feature = "postgres")]
pub use store::PgTransformationStore;
