//! Connector configuration.
//!
//! Adapters receive their configuration as a string key-value map, read
//! from the environment or a config file by the embedding service, and
//! parse it into a typed config (see
//! [`PostgresConfig::from_config`](crate::postgres::PostgresConfig::from_config)).

use std::collections::HashMap;
use std::fmt;

use crate::error::ConnectorError;

/// Key-value configuration for one adapter.
#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    /// Adapter type identifier (e.g. "postgres").
    connector_type: String,

    properties: HashMap<String, String>,
}

impl ConnectorConfig {
    /// Creates an empty config for the given adapter type.
    #[must_use]
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Creates a config from existing properties.
    #[must_use]
    pub fn with_properties(
        connector_type: impl Into<String>,
        properties: HashMap<String, String>,
    ) -> Self {
        Self {
            connector_type: connector_type.into(),
            properties,
        }
    }

    /// Returns the adapter type identifier.
    #[must_use]
    pub fn connector_type(&self) -> &str {
        &self.connector_type
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Gets a required property.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if the key is not set.
    pub fn require(&self, key: &str) -> Result<&str, ConnectorError> {
        self.get(key)
            .ok_or_else(|| ConnectorError::MissingConfig(key.to_string()))
    }

    /// Gets a property parsed as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` if the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConnectorError>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.parse::<T>().map(Some).map_err(|e| {
                ConnectorError::ConfigurationError(format!("invalid value for '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Gets a required property parsed as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if the key is missing, or
    /// `ConnectorError::ConfigurationError` if parsing fails.
    pub fn require_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T, ConnectorError>
    where
        T::Err: fmt::Display,
    {
        let value = self.require(key)?;
        value.parse::<T>().map_err(|e| {
            ConnectorError::ConfigurationError(format!("invalid value for '{key}': {e}"))
        })
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

impl fmt::Display for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.properties.keys().map(String::as_str).collect();
        keys.sort_unstable();
        // Values are omitted; they may hold credentials.
        write!(f, "{}({})", self.connector_type, keys.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_require() {
        let mut config = ConnectorConfig::new("postgres");
        config.set("hostname", "db");
        assert_eq!(config.get("hostname"), Some("db"));
        assert_eq!(config.require("hostname").unwrap(), "db");
        assert!(matches!(
            config.require("database"),
            Err(ConnectorError::MissingConfig(key)) if key == "database"
        ));
    }

    #[test]
    fn test_get_parsed() {
        let mut config = ConnectorConfig::new("postgres");
        config.set("port", "5433");
        config.set("bad", "abc");
        assert_eq!(config.get_parsed::<u16>("port").unwrap(), Some(5433));
        assert_eq!(config.get_parsed::<u16>("missing").unwrap(), None);
        assert!(matches!(
            config.get_parsed::<u16>("bad"),
            Err(ConnectorError::ConfigurationError(_))
        ));
        assert!(matches!(
            config.require_parsed::<u16>("missing"),
            Err(ConnectorError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_display_hides_values() {
        let mut config = ConnectorConfig::new("postgres");
        config.set("password", "secret");
        config.set("hostname", "db");
        let shown = config.to_string();
        assert_eq!(shown, "postgres(hostname, password)");
        assert!(!shown.contains("secret"));
    }
}
