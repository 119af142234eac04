//! Registry seam for transformation definitions.

use super::chain::{Transformation, TransformationKey};
use super::RegistryError;

/// Source of single-step transformations.
///
/// Implementations typically cache definitions per key; `invalidate` is
/// called when a `TransformationSetChanged` signal arrives for that key.
pub trait TransformationRegistry: Send + Sync {
    /// Returns every registered step for `key`, in registry order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the definitions cannot be loaded.
    fn transformations_for(
        &self,
        key: &TransformationKey,
    ) -> Result<Vec<Transformation>, RegistryError>;

    /// Drops any cached definitions for `key`.
    fn invalidate(&self, key: &TransformationKey);
}
