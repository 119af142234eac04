//! # Fact Filtering
//!
//! Per-subscription predicate deciding whether a candidate fact is
//! delivered. Constructed once per subscription request and evaluated once
//! per candidate, possibly from several catchup workers concurrently.
//!
//! ## Evaluation Order
//!
//! 1. Blacklist lookup (cheapest, rejects immediately)
//! 2. Match-anything fast path (some spec has no constraining clause)
//! 3. OR over [`FactSpec`](crate::FactSpec)s, each an AND over its clauses,
//!    cheapest clause first, script last

mod fact_filter;
mod matcher;

pub use fact_filter::FactFilter;

use crate::fact::FactError;
use crate::script::ScriptError;

/// Errors raised while building or evaluating a filter.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// A filter script failed to compile or run.
    #[error("filter script error: {0}")]
    Script(#[from] ScriptError),

    /// The fact's header or payload could not be decoded.
    #[error("fact decoding error: {0}")]
    Fact(#[from] FactError),
}
