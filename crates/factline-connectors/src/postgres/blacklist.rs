//! Blacklist table.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Client;
use uuid::Uuid;

use factline_core::blacklist::BlacklistSource;
use factline_core::transform::RegistryError;

use super::connection::read_error;
use super::{sql, PostgresConfig};

/// [`BlacklistSource`] reading the `blacklist(id)` table.
pub struct PgBlacklistSource {
    client: Arc<Client>,
    select: String,
}

impl PgBlacklistSource {
    /// Creates a source using `client` and the configured blacklist table.
    #[must_use]
    pub fn new(client: Arc<Client>, config: &PostgresConfig) -> Self {
        Self {
            client,
            select: sql::select_blacklist(&config.blacklist_table),
        }
    }
}

impl std::fmt::Debug for PgBlacklistSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBlacklistSource")
            .field("select", &self.select)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BlacklistSource for PgBlacklistSource {
    async fn blocked_ids(&self) -> Result<HashSet<Uuid>, RegistryError> {
        let rows = self
            .client
            .query(&self.select, &[])
            .await
            .map_err(|e| RegistryError::from(read_error(&e)))?;

        rows.iter()
            .map(|row| {
                row.try_get::<_, Uuid>(0)
                    .map_err(|e| RegistryError::from(read_error(&e)))
            })
            .collect()
    }
}
