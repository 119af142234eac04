//! `LISTEN`/`pg_notify` publish/subscribe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::Client;

use factline_core::channel::{ChannelError, PubSubConnection, PubSubConnector};
use factline_core::signal::RawNotification;

use super::connection::{connect_listening, write_error};
use super::{sql, PostgresConfig};

/// Opens dedicated listening connections.
#[derive(Debug, Clone)]
pub struct PgPubSubConnector {
    config: PostgresConfig,
}

impl PgPubSubConnector {
    /// Creates a connector for `config`.
    #[must_use]
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PubSubConnector for PgPubSubConnector {
    async fn connect(&self) -> Result<Box<dyn PubSubConnection>, ChannelError> {
        let (client, rx, driver) = connect_listening(&self.config).await?;
        tracing::debug!(host = %self.config.hostname, "opened listening connection");
        Ok(Box::new(PgPubSubConnection {
            client: Some(client),
            rx,
            driver,
        }))
    }
}

struct PgPubSubConnection {
    client: Option<Client>,
    rx: mpsc::UnboundedReceiver<RawNotification>,
    driver: JoinHandle<()>,
}

impl PgPubSubConnection {
    fn client(&self) -> Result<&Client, ChannelError> {
        self.client.as_ref().ok_or(ChannelError::Closed)
    }
}

fn connection_error(e: &tokio_postgres::Error) -> ChannelError {
    write_error(e).into()
}

#[async_trait]
impl PubSubConnection for PgPubSubConnection {
    async fn subscribe(&mut self, channels: &[&str]) -> Result<(), ChannelError> {
        self.client()?
            .batch_execute(&sql::listen(channels))
            .await
            .map_err(|e| connection_error(&e))
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<RawNotification>, ChannelError> {
        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(first)) => first,
            Ok(None) => return Err(ChannelError::Closed),
            Err(_) => return Ok(Vec::new()),
        };
        let mut batch = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        Ok(batch)
    }

    async fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<(), ChannelError> {
        self.client()?
            .execute(sql::NOTIFY, &[&channel, &payload])
            .await
            .map(|_| ())
            .map_err(|e| connection_error(&e))
    }

    async fn close(&mut self) {
        // Dropping the client ends the connection; the driver then exits.
        self.client = None;
        self.rx.close();
        if !self.driver.is_finished() {
            self.driver.abort();
        }
    }
}

impl Drop for PgPubSubConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
