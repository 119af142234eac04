//! Durable transformation cache table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use tokio_postgres::Client;
use uuid::Uuid;

use factline_core::cache::{CacheKey, StoreError, TransformationStore};
use factline_core::fact::Fact;
use factline_core::transform::TransformationKey;

use super::connection::{read_error, write_error};
use super::{connect, sql, PostgresConfig};
use crate::error::ConnectorError;

/// [`TransformationStore`] over the `transformationcache` table.
///
/// Rows are keyed by the [`CacheKey`] text (`{id}-{version}-{chain}`), so
/// deleting every row of one fact is a key-prefix match.
pub struct PgTransformationStore {
    client: Arc<Client>,
    select_one: String,
    select_many: String,
    touch: String,
    upsert: String,
    delete_for_fact: String,
    delete_for_key: String,
    delete_older_than: String,
}

impl PgTransformationStore {
    /// Creates a store using `client` and the configured cache table.
    #[must_use]
    pub fn new(client: Arc<Client>, config: &PostgresConfig) -> Self {
        let table = config.cache_table.as_str();
        Self {
            client,
            select_one: sql::select_one(table),
            select_many: sql::select_many(table),
            touch: sql::touch(table),
            upsert: sql::upsert(table),
            delete_for_fact: sql::delete_for_fact(table),
            delete_for_key: sql::delete_for_key(table),
            delete_older_than: sql::delete_older_than(table),
        }
    }

    /// Opens a dedicated connection and creates a store over it.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConnectionFailed` if the connection fails.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, ConnectorError> {
        let (client, _driver) = connect(config).await?;
        Ok(Self::new(Arc::new(client), config))
    }
}

impl std::fmt::Debug for PgTransformationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransformationStore")
            .finish_non_exhaustive()
    }
}

fn read_failed(e: &tokio_postgres::Error) -> StoreError {
    read_error(e).into()
}

fn write_failed(e: &tokio_postgres::Error) -> StoreError {
    write_error(e).into()
}

fn decode(key: &CacheKey, header: &str, payload: Vec<u8>) -> Result<Fact, StoreError> {
    Fact::from_json(header, payload).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl TransformationStore for PgTransformationStore {
    async fn find(&self, key: &CacheKey) -> Result<Option<Fact>, StoreError> {
        let row = self
            .client
            .query_opt(&self.select_one, &[&key.to_string()])
            .await
            .map_err(|e| read_failed(&e))?;
        match row {
            Some(row) => {
                let header: String = row.try_get(0).map_err(|e| read_failed(&e))?;
                let payload: Vec<u8> = row.try_get(1).map_err(|e| read_failed(&e))?;
                decode(key, &header, payload).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn find_all(&self, keys: &[CacheKey]) -> Result<Vec<(CacheKey, Fact)>, StoreError> {
        let by_text: FxHashMap<String, &CacheKey> =
            keys.iter().map(|key| (key.to_string(), key)).collect();
        let texts: Vec<&str> = by_text.keys().map(String::as_str).collect();

        let rows = self
            .client
            .query(&self.select_many, &[&texts])
            .await
            .map_err(|e| read_failed(&e))?;

        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get(0).map_err(|e| read_failed(&e))?;
            let Some(key) = by_text.get(&text) else {
                continue;
            };
            let header: String = row.try_get(1).map_err(|e| read_failed(&e))?;
            let payload: Vec<u8> = row.try_get(2).map_err(|e| read_failed(&e))?;
            found.push(((*key).clone(), decode(key, &header, payload)?));
        }
        Ok(found)
    }

    async fn touch(&self, keys: &[CacheKey], at: DateTime<Utc>) -> Result<(), StoreError> {
        let texts: Vec<String> = keys.iter().map(ToString::to_string).collect();
        self.client
            .execute(&self.touch, &[&at, &texts])
            .await
            .map(|_| ())
            .map_err(|e| write_failed(&e))
    }

    async fn upsert(&self, entries: &[(CacheKey, Fact)], at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(entries.len());
        for (key, fact) in entries {
            let header = fact.header_json().map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            })?;
            rows.push((key.to_string(), header, fact.payload().to_vec()));
        }

        // Statements on one client are pipelined.
        let writes = rows.iter().map(|(key, header, payload)| {
            self.client
                .execute(&self.upsert, &[key, header, payload, &at])
        });
        for result in futures::future::join_all(writes).await {
            result.map_err(|e| write_failed(&e))?;
        }
        Ok(())
    }

    async fn delete_for_fact(&self, fact_id: Uuid) -> Result<u64, StoreError> {
        let pattern = format!("{}%", CacheKey::fact_prefix(fact_id));
        self.client
            .execute(&self.delete_for_fact, &[&pattern])
            .await
            .map_err(|e| write_failed(&e))
    }

    async fn delete_for_key(&self, key: &TransformationKey) -> Result<u64, StoreError> {
        self.client
            .execute(&self.delete_for_key, &[&key.ns, &key.type_])
            .await
            .map_err(|e| write_failed(&e))
    }

    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        self.client
            .execute(&self.delete_older_than, &[&threshold])
            .await
            .map_err(|e| write_failed(&e))
    }
}
