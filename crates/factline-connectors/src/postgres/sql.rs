//! SQL text used by the `PostgreSQL` adapters.
//!
//! Table names come from a validated [`PostgresConfig`](super::PostgresConfig).

/// `LISTEN` statements for `channels`, as one batch.
#[must_use]
pub fn listen(channels: &[&str]) -> String {
    channels
        .iter()
        .map(|channel| format!("LISTEN \"{channel}\";"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Publishes a notification. Parameters: channel, payload (nullable).
pub const NOTIFY: &str = "SELECT pg_notify($1, $2)";

/// Looks up one cache row. Parameter: key.
#[must_use]
pub fn select_one(table: &str) -> String {
    format!("SELECT header::text, payload FROM {table} WHERE cache_key = $1")
}

/// Looks up many cache rows. Parameter: key array.
#[must_use]
pub fn select_many(table: &str) -> String {
    format!("SELECT cache_key, header::text, payload FROM {table} WHERE cache_key = ANY($1)")
}

/// Refreshes access times. Parameters: timestamp, key array.
#[must_use]
pub fn touch(table: &str) -> String {
    format!("UPDATE {table} SET last_access = $1 WHERE cache_key = ANY($2)")
}

/// Inserts or replaces one cache row. Parameters: key, header, payload,
/// timestamp.
#[must_use]
pub fn upsert(table: &str) -> String {
    format!(
        "INSERT INTO {table} (cache_key, header, payload, last_access) \
         VALUES ($1, $2::text::jsonb, $3, $4) \
         ON CONFLICT (cache_key) DO UPDATE SET \
         header = EXCLUDED.header, payload = EXCLUDED.payload, last_access = EXCLUDED.last_access"
    )
}

/// Deletes every row of one fact. Parameter: `LIKE` key prefix pattern.
#[must_use]
pub fn delete_for_fact(table: &str) -> String {
    format!("DELETE FROM {table} WHERE cache_key LIKE $1")
}

/// Deletes every row with the given coordinates. Parameters: ns, type.
#[must_use]
pub fn delete_for_key(table: &str) -> String {
    format!("DELETE FROM {table} WHERE header->>'ns' = $1 AND header->>'type' = $2")
}

/// Deletes rows not accessed since a threshold. Parameter: threshold.
#[must_use]
pub fn delete_older_than(table: &str) -> String {
    format!("DELETE FROM {table} WHERE last_access < $1")
}

/// Reads every blocked id.
#[must_use]
pub fn select_blacklist(table: &str) -> String {
    format!("SELECT id FROM {table}")
}
