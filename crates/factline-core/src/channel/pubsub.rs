//! Seam to the backing store's publish/subscribe primitive.

use std::time::Duration;

use async_trait::async_trait;

use crate::signal::RawNotification;

use super::ChannelError;

/// Opens connections to the publish/subscribe primitive.
#[async_trait]
pub trait PubSubConnector: Send + Sync {
    /// Opens a new, exclusively owned connection.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Connect` if the store is unreachable.
    async fn connect(&self) -> Result<Box<dyn PubSubConnection>, ChannelError>;
}

/// One listening connection.
///
/// Dropping a pending `receive` future must be safe; the listener does so
/// on shutdown.
#[async_trait]
pub trait PubSubConnection: Send {
    /// Starts listening on every named channel.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError` if the connection fails.
    async fn subscribe(&mut self, channels: &[&str]) -> Result<(), ChannelError>;

    /// Waits up to `timeout` for notifications, returning everything
    /// available (possibly nothing).
    ///
    /// # Errors
    ///
    /// Returns `ChannelError` if the connection fails.
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<RawNotification>, ChannelError>;

    /// Publishes a notification on `channel`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError` if the connection fails.
    async fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<(), ChannelError>;

    /// Closes the connection. Idempotent.
    async fn close(&mut self);
}
