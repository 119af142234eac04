//! # Transformations
//!
//! Schema-version transformation of fact payloads on the way to a
//! subscriber.
//!
//! ## Components
//!
//! - [`TransformationRegistry`]: source of single-step [`Transformation`]s
//! - [`TransformationChainResolver`]: shortest path from a fact's version to
//!   the nearest requested version, as a cacheable [`TransformationChain`]
//! - [`FactTransformer`]: runs a chain through the script engine
//! - [`TransformingConsumer`]: direct/buffering front that transforms only
//!   when needed and never reorders facts

mod chain;
mod consumer;
mod registry;
mod resolver;
mod transformer;

pub use chain::{Transformation, TransformationChain, TransformationKey};
pub use consumer::{ConsumerMode, FactConsumer, TransformingConsumer};
pub use registry::TransformationRegistry;
pub use resolver::{RequestedVersions, TransformationChainResolver};
pub use transformer::{FactTransformer, TransformerMetrics};

use uuid::Uuid;

use crate::fact::FactError;
use crate::script::ScriptError;

/// Errors raised while resolving or applying transformations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformationError {
    /// No path exists from the fact's version to any requested version.
    #[error("no transformation path for {key} from version {from} to any of {targets:?}")]
    NoChain {
        /// Fact coordinates.
        key: TransformationKey,
        /// Version the fact is at.
        from: u32,
        /// Requested versions.
        targets: Vec<u32>,
    },

    /// A transformation script failed.
    #[error("transformation of fact {id} failed: {source}")]
    Script {
        /// Fact being transformed.
        id: Uuid,
        /// Underlying script error.
        #[source]
        source: ScriptError,
    },

    /// The fact could not be decoded or the result encoded.
    #[error("fact error: {0}")]
    Fact(#[from] FactError),

    /// The registry could not be consulted.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Waiting for a pending transformation exceeded the configured bound.
    #[error("timed out waiting for transformation of fact {0}")]
    Timeout(Uuid),

    /// The pending transformation was dropped before it resolved.
    #[error("transformation of fact {0} was cancelled")]
    Cancelled(Uuid),
}

/// Errors raised by the transformation registry or blacklist source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// The backing store could not be reached or queried.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// A stored definition could not be decoded.
    #[error("invalid registry entry: {0}")]
    Invalid(String),
}
