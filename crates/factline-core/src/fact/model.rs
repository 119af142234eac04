//! Fact header and fact value types.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::FactError;

// ---------------------------------------------------------------------------
// FactHeader
// ---------------------------------------------------------------------------

/// The JSON header of a fact.
///
/// Unknown header fields (serial, timestamps, ...) are kept in `extra` so a
/// header survives a decode/encode cycle unchanged apart from the fields
/// the pipeline rewrites (`version`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactHeader {
    /// Unique fact id.
    pub id: Uuid,
    /// Namespace.
    pub ns: String,
    /// Fact type, if any.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Schema version of the payload (`0` = unversioned).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u32,
    /// Aggregate ids the fact belongs to.
    #[serde(rename = "aggIds", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aggregate_ids: BTreeSet<Uuid>,
    /// Metadata multimap. A key with an empty value list is present but null.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        serialize_with = "serialize_meta",
        deserialize_with = "deserialize_meta"
    )]
    pub meta: BTreeMap<String, Vec<String>>,
    /// Header fields not interpreted by the pipeline.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde skip_serializing_if signature
fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// A meta value is either a single (nullable) string or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum MetaValue {
    One(Option<String>),
    Many(Vec<Option<String>>),
}

fn deserialize_meta<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, MetaValue>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let values = match v {
                MetaValue::One(one) => one.into_iter().collect(),
                MetaValue::Many(many) => many.into_iter().flatten().collect(),
            };
            (k, values)
        })
        .collect())
}

fn serialize_meta<S>(meta: &BTreeMap<String, Vec<String>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;

    let mut map = serializer.serialize_map(Some(meta.len()))?;
    for (k, values) in meta {
        match values.as_slice() {
            [] => map.serialize_entry(k, &Value::Null)?,
            [one] => map.serialize_entry(k, one)?,
            many => map.serialize_entry(k, many)?,
        }
    }
    map.end()
}

// ---------------------------------------------------------------------------
// Fact
// ---------------------------------------------------------------------------

/// An immutable, versioned event record.
///
/// Cloning is cheap: the payload is reference-counted [`Bytes`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    header: FactHeader,
    payload: Bytes,
}

impl Fact {
    /// Creates a fact from an already parsed header and raw payload.
    #[must_use]
    pub fn new(header: FactHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Decodes a fact from its header JSON text and payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `FactError::InvalidHeader` if the header cannot be parsed.
    pub fn from_json(header: &str, payload: impl Into<Bytes>) -> Result<Self, FactError> {
        let header: FactHeader =
            serde_json::from_str(header).map_err(|e| FactError::InvalidHeader(e.to_string()))?;
        Ok(Self::new(header, payload))
    }

    /// Starts a [`FactBuilder`].
    #[must_use]
    pub fn builder() -> FactBuilder {
        FactBuilder::default()
    }

    /// Returns the fact id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    /// Returns the namespace.
    #[must_use]
    pub fn ns(&self) -> &str {
        &self.header.ns
    }

    /// Returns the fact type, if any.
    #[must_use]
    pub fn type_(&self) -> Option<&str> {
        self.header.type_.as_deref()
    }

    /// Returns the payload schema version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.header.version
    }

    /// Returns the aggregate ids.
    #[must_use]
    pub fn aggregate_ids(&self) -> &BTreeSet<Uuid> {
        &self.header.aggregate_ids
    }

    /// Returns all values recorded for a meta key, or `None` if absent.
    #[must_use]
    pub fn meta_values(&self, key: &str) -> Option<&[String]> {
        self.header.meta.get(key).map(Vec::as_slice)
    }

    /// Returns the parsed header.
    #[must_use]
    pub fn header(&self) -> &FactHeader {
        &self.header
    }

    /// Returns the raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encodes the header as JSON text.
    ///
    /// # Errors
    ///
    /// Returns `FactError::Encoding` if serialization fails.
    pub fn header_json(&self) -> Result<String, FactError> {
        serde_json::to_string(&self.header).map_err(|e| FactError::Encoding(e.to_string()))
    }

    /// Returns the header as a JSON tree.
    ///
    /// # Errors
    ///
    /// Returns `FactError::Encoding` if serialization fails.
    pub fn header_value(&self) -> Result<Value, FactError> {
        serde_json::to_value(&self.header).map_err(|e| FactError::Encoding(e.to_string()))
    }

    /// Parses the payload into a JSON tree.
    ///
    /// # Errors
    ///
    /// Returns `FactError::InvalidPayload` if the payload is not JSON.
    pub fn payload_value(&self) -> Result<Value, FactError> {
        serde_json::from_slice(&self.payload).map_err(|e| FactError::InvalidPayload {
            id: self.header.id,
            message: e.to_string(),
        })
    }

    /// Returns a new fact with the given version and payload.
    ///
    /// The receiver is left untouched.
    #[must_use]
    pub fn with_version_and_payload(&self, version: u32, payload: impl Into<Bytes>) -> Self {
        let mut header = self.header.clone();
        header.version = version;
        Self {
            header,
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// FactBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Fact`] values.
///
/// A random id is assigned unless [`FactBuilder::id`] is called.
#[derive(Debug, Default)]
pub struct FactBuilder {
    id: Option<Uuid>,
    ns: String,
    type_: Option<String>,
    version: u32,
    aggregate_ids: BTreeSet<Uuid>,
    meta: BTreeMap<String, Vec<String>>,
    payload: Option<Bytes>,
}

impl FactBuilder {
    /// Sets the fact id.
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = ns.into();
        self
    }

    /// Sets the type.
    #[must_use]
    pub fn type_(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Adds an aggregate id.
    #[must_use]
    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.insert(id);
        self
    }

    /// Appends a meta value under `key`.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Sets the raw payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets the payload from a JSON tree.
    #[must_use]
    pub fn payload_json(self, payload: &Value) -> Self {
        let text = payload.to_string();
        self.payload(text)
    }

    /// Builds the fact. An unset payload becomes `{}`.
    #[must_use]
    pub fn build(self) -> Fact {
        Fact {
            header: FactHeader {
                id: self.id.unwrap_or_else(Uuid::new_v4),
                ns: self.ns,
                type_: self.type_,
                version: self.version,
                aggregate_ids: self.aggregate_ids,
                meta: self.meta,
                extra: Map::new(),
            },
            payload: self.payload.unwrap_or_else(|| Bytes::from_static(b"{}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_roundtrip_keeps_unknown_fields() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"id":"{id}","ns":"user","type":"created","version":2,"meta":{{"k":"v"}},"serial":17}}"#
        );
        let fact = Fact::from_json(&text, "{}").unwrap();
        assert_eq!(fact.id(), id);
        assert_eq!(fact.type_(), Some("created"));
        assert_eq!(fact.version(), 2);
        assert_eq!(fact.meta_values("k"), Some(&["v".to_string()][..]));

        let encoded: Value = serde_json::from_str(&fact.header_json().unwrap()).unwrap();
        assert_eq!(encoded["serial"], json!(17));
        assert_eq!(encoded["meta"]["k"], json!("v"));
    }

    #[test]
    fn test_meta_multimap_and_null() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"id":"{id}","ns":"n","meta":{{"a":["x","y"],"b":null}}}}"#);
        let fact = Fact::from_json(&text, "{}").unwrap();
        assert_eq!(fact.meta_values("a").unwrap().len(), 2);
        assert_eq!(fact.meta_values("b"), Some(&[][..]));
        assert_eq!(fact.meta_values("c"), None);
    }

    #[test]
    fn test_invalid_header() {
        let err = Fact::from_json("not json", "{}").unwrap_err();
        assert!(err.to_string().contains("invalid fact header"));
    }

    #[test]
    fn test_with_version_and_payload_does_not_mutate() {
        let fact = Fact::builder()
            .ns("user")
            .type_("created")
            .version(1)
            .payload_json(&json!({"name": "a"}))
            .build();
        let next = fact.with_version_and_payload(2, r#"{"name":"a","x":1}"#);

        assert_eq!(fact.version(), 1);
        assert_eq!(next.version(), 2);
        assert_eq!(next.id(), fact.id());
        assert_eq!(next.payload_value().unwrap()["x"], json!(1));
        assert_eq!(fact.payload_value().unwrap().get("x"), None);
    }

    #[test]
    fn test_payload_value_error() {
        let fact = Fact::builder().ns("n").payload("{broken").build();
        assert!(matches!(
            fact.payload_value(),
            Err(FactError::InvalidPayload { .. })
        ));
    }
}
