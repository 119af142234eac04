//! Connection setup.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

use factline_core::signal::RawNotification;

use super::PostgresConfig;
use crate::error::ConnectorError;

/// Maps a failed query to [`ConnectorError::ReadError`] or `Closed`.
pub(super) fn read_error(e: &tokio_postgres::Error) -> ConnectorError {
    ConnectorError::classify(e.is_closed(), ConnectorError::ReadError, e)
}

/// Maps a failed statement to [`ConnectorError::WriteError`] or `Closed`.
pub(super) fn write_error(e: &tokio_postgres::Error) -> ConnectorError {
    ConnectorError::classify(e.is_closed(), ConnectorError::WriteError, e)
}

/// Connects a regular client.
///
/// Spawns a background task to drive the connection. The caller must
/// keep the client alive; dropping it closes the connection and ends the
/// task.
///
/// # Errors
///
/// Returns `ConnectorError::ConnectionFailed` if the connection fails.
pub async fn connect(config: &PostgresConfig) -> Result<(Client, JoinHandle<()>), ConnectorError> {
    let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
        .await
        .map_err(|e| ConnectorError::ConnectionFailed(format!("PostgreSQL connect: {e}")))?;

    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });

    Ok((client, handle))
}

/// Connects a client whose asynchronous notifications are forwarded to
/// the returned receiver.
///
/// The receiver yields `None` once the connection ends, whether by error
/// or because the client was dropped.
///
/// # Errors
///
/// Returns `ConnectorError::ConnectionFailed` if the connection fails.
pub(super) async fn connect_listening(
    config: &PostgresConfig,
) -> Result<(Client, mpsc::UnboundedReceiver<RawNotification>, JoinHandle<()>), ConnectorError> {
    let (client, mut connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
        .await
        .map_err(|e| ConnectorError::ConnectionFailed(format!("PostgreSQL connect: {e}")))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    let payload = n.payload();
                    let raw = RawNotification {
                        channel: n.channel().to_string(),
                        payload: (!payload.is_empty()).then(|| payload.to_string()),
                    };
                    if tx.send(raw).is_err() {
                        break;
                    }
                }
                Ok(AsyncMessage::Notice(notice)) => {
                    tracing::debug!(notice = %notice, "PostgreSQL notice");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "PostgreSQL listening connection error");
                    break;
                }
            }
        }
    });

    Ok((client, rx, handle))
}
