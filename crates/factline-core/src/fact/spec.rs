//! Subscriber-supplied fact selection criteria.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wildcard value for namespace and type clauses.
const WILDCARD: &str = "*";

/// Embedded predicate script attached to a [`FactSpec`].
///
/// The script must expose `test(header, payload) -> bool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterScript {
    /// Script language identifier (e.g. `"js"`).
    pub language_type: String,
    /// Script source text.
    pub source: String,
}

impl FilterScript {
    /// Creates a script in the given language.
    #[must_use]
    pub fn new(language_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language_type: language_type.into(),
            source: source.into(),
        }
    }

    /// Creates a JavaScript filter script.
    #[must_use]
    pub fn js(source: impl Into<String>) -> Self {
        Self::new("js", source)
    }
}

/// One AND-combination of filter clauses.
///
/// A subscription holds a disjunction of these. Every clause left at its
/// default value matches anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactSpec {
    /// Namespace, or `"*"` for any.
    pub ns: String,
    /// Type; `None` or `"*"` matches any.
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    /// Requested version; `0` matches any.
    #[serde(default)]
    pub version: u32,
    /// Aggregate ids the fact must all carry.
    #[serde(rename = "aggIds", default)]
    pub aggregate_ids: BTreeSet<Uuid>,
    /// Meta values that must be present.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Meta keys that must be present (`true`) or absent (`false`).
    #[serde(default)]
    pub meta_key_exists: BTreeMap<String, bool>,
    /// Dotted payload paths whose leaf must equal the given id.
    #[serde(default)]
    pub aggregate_id_properties: BTreeMap<String, Uuid>,
    /// Optional scripted predicate.
    #[serde(default)]
    pub filter_script: Option<FilterScript>,
}

impl FactSpec {
    /// Creates a spec selecting the given namespace.
    #[must_use]
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            ..Self::default()
        }
    }

    /// Restricts matches to a type.
    #[must_use]
    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }

    /// Restricts matches to (or requests) a version.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Requires the fact to carry the aggregate id.
    #[must_use]
    pub fn with_aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.insert(id);
        self
    }

    /// Requires a meta value.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Requires a meta key to be present.
    #[must_use]
    pub fn with_meta_exists(mut self, key: impl Into<String>) -> Self {
        self.meta_key_exists.insert(key.into(), true);
        self
    }

    /// Requires a meta key to be absent.
    #[must_use]
    pub fn with_meta_does_not_exist(mut self, key: impl Into<String>) -> Self {
        self.meta_key_exists.insert(key.into(), false);
        self
    }

    /// Requires the payload value at a dotted path to equal the id.
    #[must_use]
    pub fn with_aggregate_id_property(mut self, path: impl Into<String>, id: Uuid) -> Self {
        self.aggregate_id_properties.insert(path.into(), id);
        self
    }

    /// Attaches a scripted predicate.
    #[must_use]
    pub fn with_filter_script(mut self, script: FilterScript) -> Self {
        self.filter_script = Some(script);
        self
    }

    /// Returns `true` if no clause constrains the set of matching facts.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.ns == WILDCARD
            && self.type_.as_deref().map_or(true, |t| t == WILDCARD)
            && self.version == 0
            && self.aggregate_ids.is_empty()
            && self.meta.is_empty()
            && self.meta_key_exists.is_empty()
            && self.aggregate_id_properties.is_empty()
            && self.filter_script.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconstrained() {
        assert!(FactSpec::ns("*").is_unconstrained());
        assert!(FactSpec::ns("*").with_type("*").is_unconstrained());
        assert!(!FactSpec::ns("user").is_unconstrained());
        assert!(!FactSpec::ns("*").with_version(1).is_unconstrained());
        assert!(!FactSpec::ns("*").with_meta_exists("k").is_unconstrained());
        assert!(!FactSpec::ns("*")
            .with_filter_script(FilterScript::js("function test(h,e){return true}"))
            .is_unconstrained());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"ns":"user","type":"created","version":2,"metaKeyExists":{{"x":false}},"aggregateIdProperties":{{"a.b":"{id}"}}}}"#
        );
        let spec: FactSpec = serde_json::from_str(&text).unwrap();
        assert_eq!(spec.type_.as_deref(), Some("created"));
        assert_eq!(spec.version, 2);
        assert_eq!(spec.meta_key_exists.get("x"), Some(&false));
        assert_eq!(spec.aggregate_id_properties.get("a.b"), Some(&id));
    }
}
