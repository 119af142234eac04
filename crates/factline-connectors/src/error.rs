//! Connector error types.
//!
//! [`ConnectorError`] covers everything an adapter can fail with. At the
//! core trait seams it converts into the error type the seam expects.

use factline_core::cache::StoreError;
use factline_core::channel::ChannelError;
use factline_core::transform::RegistryError;
use thiserror::Error;

/// Errors that can occur in backing-store adapters.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Failed to connect to the external system.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid connector configuration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// Error reading from the store.
    #[error("read error: {0}")]
    ReadError(String),

    /// Error writing to the store.
    #[error("write error: {0}")]
    WriteError(String),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,
}

impl ConnectorError {
    /// Classifies a failed store operation: [`ConnectorError::Closed`] if
    /// the connection is gone, otherwise `kind` with the driver message.
    #[must_use]
    pub fn classify(closed: bool, kind: fn(String) -> Self, message: impl ToString) -> Self {
        if closed {
            Self::Closed
        } else {
            kind(message.to_string())
        }
    }
}

impl From<ConnectorError> for ChannelError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::ConnectionFailed(msg) => ChannelError::Connect(msg),
            ConnectorError::Closed => ChannelError::Closed,
            other => ChannelError::Connection(other.to_string()),
        }
    }
}

impl From<ConnectorError> for StoreError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::ConnectionFailed(msg) => StoreError::Unavailable(msg),
            ConnectorError::Closed => StoreError::Unavailable("connection closed".to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl From<ConnectorError> for RegistryError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::ConfigurationError(msg) => RegistryError::Invalid(msg),
            other => RegistryError::Unavailable(other.to_string()),
        }
    }
}
