//! Compiled form of one [`FactSpec`] (an AND over its clauses).

use serde_json::Value;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::fact::{Fact, FactSpec};
use crate::script::{truthy, ScriptCache, ScriptHandle};

use super::FilterError;

const WILDCARD: &str = "*";

/// Entry point a filter script must expose.
const TEST_FUNCTION: &str = "test";

// ---------------------------------------------------------------------------
// ParsedFact: lazily decoded header and payload trees
// ---------------------------------------------------------------------------

/// Per-evaluation memo so the payload is parsed at most once even when
/// several specs inspect it.
pub(super) struct ParsedFact<'a> {
    fact: &'a Fact,
    payload: Option<Value>,
    header: Option<Value>,
}

impl<'a> ParsedFact<'a> {
    pub(super) fn new(fact: &'a Fact) -> Self {
        Self {
            fact,
            payload: None,
            header: None,
        }
    }

    fn payload(&mut self) -> Result<&Value, FilterError> {
        if self.payload.is_none() {
            self.payload = Some(self.fact.payload_value()?);
        }
        Ok(self.payload.get_or_insert(Value::Null))
    }

    fn header_and_payload(&mut self) -> Result<[Value; 2], FilterError> {
        if self.header.is_none() {
            self.header = Some(self.fact.header_value()?);
        }
        let payload = self.payload()?.clone();
        let header = self.header.clone().unwrap_or(Value::Null);
        Ok([header, payload])
    }
}

// ---------------------------------------------------------------------------
// FactSpecMatcher
// ---------------------------------------------------------------------------

/// A dotted payload path and the canonical id string its leaf must equal.
#[derive(Debug, Clone)]
struct IdProperty {
    segments: SmallVec<[String; 4]>,
    expected: String,
}

/// Pre-processed clauses of one spec.
///
/// Wildcards are resolved to `None` at construction so evaluation is a
/// sequence of cheap comparisons.
pub(super) struct FactSpecMatcher {
    ns: Option<String>,
    type_: Option<String>,
    version: u32,
    aggregate_ids: SmallVec<[Uuid; 2]>,
    meta: Vec<(String, String)>,
    meta_key_exists: Vec<(String, bool)>,
    id_properties: Vec<IdProperty>,
    script: Option<ScriptHandle>,
}

impl FactSpecMatcher {
    /// Compiles a spec, resolving its script (if any) through `scripts`.
    pub(super) fn new(spec: &FactSpec, scripts: &ScriptCache) -> Result<Self, FilterError> {
        let script = match &spec.filter_script {
            Some(s) => Some(scripts.get_or_compile_in(&s.language_type, &s.source)?),
            None => None,
        };

        Ok(Self {
            ns: Some(spec.ns.clone()).filter(|ns| ns != WILDCARD),
            type_: spec.type_.clone().filter(|t| t != WILDCARD),
            version: spec.version,
            aggregate_ids: spec.aggregate_ids.iter().copied().collect(),
            meta: spec
                .meta
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            meta_key_exists: spec
                .meta_key_exists
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            id_properties: spec
                .aggregate_id_properties
                .iter()
                .map(|(path, id)| IdProperty {
                    segments: path.split('.').map(str::to_string).collect(),
                    expected: id.to_string(),
                })
                .collect(),
            script,
        })
    }

    /// Evaluates every clause; all must hold.
    pub(super) fn matches(&self, parsed: &mut ParsedFact<'_>) -> Result<bool, FilterError> {
        let fact = parsed.fact;
        Ok(self.matches_ns(fact)
            && self.matches_type(fact)
            && self.matches_version(fact)
            && self.matches_aggregate_ids(fact)
            && self.matches_meta(fact)
            && self.matches_meta_key_exists(fact)
            && self.matches_id_properties(parsed)?
            && self.matches_script(parsed)?)
    }

    fn matches_ns(&self, fact: &Fact) -> bool {
        self.ns.as_deref().map_or(true, |ns| ns == fact.ns())
    }

    fn matches_type(&self, fact: &Fact) -> bool {
        self.type_
            .as_deref()
            .map_or(true, |t| fact.type_() == Some(t))
    }

    fn matches_version(&self, fact: &Fact) -> bool {
        self.version == 0 || self.version == fact.version()
    }

    fn matches_aggregate_ids(&self, fact: &Fact) -> bool {
        let have = fact.aggregate_ids();
        self.aggregate_ids.iter().all(|id| have.contains(id))
    }

    fn matches_meta(&self, fact: &Fact) -> bool {
        self.meta.iter().all(|(key, value)| {
            fact.meta_values(key)
                .is_some_and(|values| values.iter().any(|v| v == value))
        })
    }

    fn matches_meta_key_exists(&self, fact: &Fact) -> bool {
        self.meta_key_exists.iter().all(|(key, must_exist)| {
            let present = fact.meta_values(key).is_some_and(|v| !v.is_empty());
            present == *must_exist
        })
    }

    fn matches_id_properties(&self, parsed: &mut ParsedFact<'_>) -> Result<bool, FilterError> {
        if self.id_properties.is_empty() {
            return Ok(true);
        }
        let payload = parsed.payload()?;
        Ok(self.id_properties.iter().all(|prop| {
            let mut node = payload;
            for segment in &prop.segments {
                match node.get(segment.as_str()) {
                    Some(child) => node = child,
                    None => return false,
                }
            }
            match node {
                Value::String(s) => *s == prop.expected,
                Value::Null => false,
                other => other.to_string() == prop.expected,
            }
        }))
    }

    fn matches_script(&self, parsed: &mut ParsedFact<'_>) -> Result<bool, FilterError> {
        let Some(script) = &self.script else {
            return Ok(true);
        };
        let args = parsed.header_and_payload()?;
        let result = script.invoke(TEST_FUNCTION, &args)?;
        Ok(truthy(&result))
    }
}
