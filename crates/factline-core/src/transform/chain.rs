//! Transformation steps and resolved chains.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fact::Fact;

/// `(ns, type)` coordinates transformations are registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransformationKey {
    /// Namespace.
    pub ns: String,
    /// Fact type.
    #[serde(rename = "type")]
    pub type_: String,
}

impl TransformationKey {
    /// Creates a key.
    #[must_use]
    pub fn new(ns: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            type_: type_.into(),
        }
    }

    /// Returns the key of a fact, or `None` for untyped facts (which are
    /// never transformed).
    #[must_use]
    pub fn of(fact: &Fact) -> Option<Self> {
        fact.type_().map(|t| Self::new(fact.ns(), t))
    }
}

impl fmt::Display for TransformationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ns, self.type_)
    }
}

/// One registered single-step transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transformation {
    /// Coordinates the step applies to.
    pub key: TransformationKey,
    /// Source version.
    pub from_version: u32,
    /// Target version.
    pub to_version: u32,
    /// Script exposing `transform(payload)`; `None` leaves the payload
    /// unchanged and only relabels the version.
    #[serde(default)]
    pub script: Option<String>,
}

impl Transformation {
    /// Creates a step.
    #[must_use]
    pub fn new(
        key: TransformationKey,
        from_version: u32,
        to_version: u32,
        script: Option<String>,
    ) -> Self {
        Self {
            key,
            from_version,
            to_version,
            script,
        }
    }
}

/// An ordered path of steps from one version to another.
///
/// The `id` is a hex SHA-256 over the key and the ordered
/// `from-to` pairs, so equal logical chains hash equally across processes.
/// It is part of every cache key derived from the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationChain {
    key: TransformationKey,
    from_version: u32,
    to_version: u32,
    steps: Vec<Transformation>,
    id: String,
}

impl TransformationChain {
    /// Builds a chain over already ordered steps.
    #[must_use]
    pub fn new(key: TransformationKey, from_version: u32, steps: Vec<Transformation>) -> Self {
        let to_version = steps.last().map_or(from_version, |s| s.to_version);
        let id = chain_id(&key, from_version, &steps);
        Self {
            key,
            from_version,
            to_version,
            steps,
            id,
        }
    }

    /// Returns the zero-length chain at `version`.
    #[must_use]
    pub fn identity(key: TransformationKey, version: u32) -> Self {
        Self::new(key, version, Vec::new())
    }

    /// Returns the key.
    #[must_use]
    pub fn key(&self) -> &TransformationKey {
        &self.key
    }

    /// Returns the source version.
    #[must_use]
    pub fn from_version(&self) -> u32 {
        self.from_version
    }

    /// Returns the target version.
    #[must_use]
    pub fn to_version(&self) -> u32 {
        self.to_version
    }

    /// Returns the ordered steps.
    #[must_use]
    pub fn steps(&self) -> &[Transformation] {
        &self.steps
    }

    /// Returns the stable chain id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `true` for the zero-length chain.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }
}

fn chain_id(key: &TransformationKey, from_version: u32, steps: &[Transformation]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.ns.as_bytes());
    hasher.update([0]);
    hasher.update(key.type_.as_bytes());
    hasher.update([0]);
    if steps.is_empty() {
        hasher.update(format!("{from_version}-{from_version}").as_bytes());
    }
    for step in steps {
        hasher.update(format!("{}-{};", step.from_version, step.to_version).as_bytes());
    }
    hex::encode(hasher.finalize())
}
