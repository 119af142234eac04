//! # Facts and Fact Specifications
//!
//! The immutable event record ([`Fact`]) that flows through the pipeline and
//! the subscriber-supplied criterion ([`FactSpec`]) used to select facts.
//!
//! A [`Fact`] is a parsed [`FactHeader`] plus the raw JSON payload bytes.
//! Facts are owned by the storage layer; the pipeline only reads them and,
//! when transforming, builds a new value via
//! [`Fact::with_version_and_payload`].

mod model;
mod spec;

pub use model::{Fact, FactBuilder, FactHeader};
pub use spec::{FactSpec, FilterScript};

/// Errors raised while decoding or encoding fact headers and payloads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FactError {
    /// The header JSON could not be parsed.
    #[error("invalid fact header: {0}")]
    InvalidHeader(String),

    /// The payload is not valid JSON.
    #[error("invalid payload for fact {id}: {message}")]
    InvalidPayload {
        /// The fact whose payload failed to parse.
        id: uuid::Uuid,
        /// Parser message.
        message: String,
    },

    /// The header could not be serialized.
    #[error("header encoding failed: {0}")]
    Encoding(String),
}
