//! `PostgreSQL` adapter configuration.

use std::time::Duration;

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

/// Connection and table settings shared by every `PostgreSQL` adapter.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Server hostname.
    pub hostname: String,

    /// Server port (default: 5432).
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username for authentication.
    pub username: String,

    /// Password for authentication.
    pub password: String,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Durable transformation cache table (default: `transformationcache`).
    pub cache_table: String,

    /// Blacklist table (default: `blacklist`).
    pub blacklist_table: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
            cache_table: "transformationcache".to_string(),
            blacklist_table: "blacklist".to_string(),
        }
    }
}

impl PostgresConfig {
    /// Parses a config from key-value properties.
    ///
    /// # Required keys
    ///
    /// - `hostname`
    /// - `database`
    /// - `username`
    ///
    /// # Optional keys
    ///
    /// `password`, `port`, `connect.timeout.ms`, `cache.table`,
    /// `blacklist.table`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if required keys are absent,
    /// or `ConnectorError::ConfigurationError` on invalid values.
    #[allow(clippy::field_reassign_with_default)]
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let mut cfg = Self::default();

        cfg.hostname = config.require("hostname")?.to_string();
        cfg.database = config.require("database")?.to_string();
        cfg.username = config.require("username")?.to_string();

        if let Some(v) = config.get("password") {
            cfg.password = v.to_string();
        }
        if let Some(port) = config.get_parsed::<u16>("port")? {
            cfg.port = port;
        }
        if let Some(ms) = config.get_parsed::<u64>("connect.timeout.ms")? {
            cfg.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = config.get("cache.table") {
            cfg.cache_table = v.to_string();
        }
        if let Some(v) = config.get("blacklist.table") {
            cfg.blacklist_table = v.to_string();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration.
    ///
    /// Table names are spliced into SQL text, so they must be plain
    /// (optionally schema-qualified) identifiers.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` on invalid values.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.database.is_empty() {
            return Err(ConnectorError::MissingConfig("database".into()));
        }
        for (key, table) in [
            ("cache.table", &self.cache_table),
            ("blacklist.table", &self.blacklist_table),
        ] {
            if !is_identifier(table) {
                return Err(ConnectorError::ConfigurationError(format!(
                    "invalid {key}: '{table}'"
                )));
            }
        }
        Ok(())
    }

    /// Builds a libpq-style connection string.
    #[must_use]
    pub fn connection_string(&self) -> String {
        let mut s = format!(
            "host={} port={} dbname={} user={} connect_timeout={}",
            self.hostname,
            self.port,
            self.database,
            self.username,
            self.connect_timeout.as_secs().max(1),
        );
        if !self.password.is_empty() {
            s.push_str(&format!(" password={}", self.password));
        }
        s
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            part.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
