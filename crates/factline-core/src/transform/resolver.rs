//! Chain resolution: from a fact's version to the nearest requested one.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};

use crate::fact::{Fact, FactSpec};

use super::chain::{Transformation, TransformationChain, TransformationKey};
use super::registry::TransformationRegistry;
use super::TransformationError;

const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// RequestedVersions
// ---------------------------------------------------------------------------

/// Versions a subscription asked for, per `(ns, type)`.
///
/// Only specs naming a concrete type contribute; an entry holding `0`
/// means at least one spec accepts that key as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedVersions {
    by_key: BTreeMap<TransformationKey, BTreeSet<u32>>,
}

impl RequestedVersions {
    /// Collects the requested versions of `specs`.
    #[must_use]
    pub fn from_specs(specs: &[FactSpec]) -> Self {
        let mut by_key: BTreeMap<TransformationKey, BTreeSet<u32>> = BTreeMap::new();
        for spec in specs {
            let Some(type_) = spec.type_.as_deref().filter(|t| *t != WILDCARD) else {
                continue;
            };
            if spec.ns == WILDCARD {
                continue;
            }
            by_key
                .entry(TransformationKey::new(spec.ns.clone(), type_))
                .or_default()
                .insert(spec.version);
        }
        Self { by_key }
    }

    /// Returns the versions requested for the fact's coordinates, or
    /// `None` if the fact is to be delivered as-is.
    #[must_use]
    pub fn targets_for(&self, fact: &Fact) -> Option<&BTreeSet<u32>> {
        let key = TransformationKey::of(fact)?;
        self.by_key
            .get(&key)
            .filter(|versions| !versions.is_empty() && !versions.contains(&0))
    }

    /// Returns `true` if no spec requests a specific version.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key
            .values()
            .all(|versions| versions.iter().all(|v| *v == 0))
    }
}

// ---------------------------------------------------------------------------
// TransformationChainResolver
// ---------------------------------------------------------------------------

/// Resolves [`TransformationChain`]s over the registry's step graph.
pub struct TransformationChainResolver {
    registry: Arc<dyn TransformationRegistry>,
}

impl TransformationChainResolver {
    /// Creates a resolver over `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn TransformationRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn TransformationRegistry> {
        &self.registry
    }

    /// Returns `false` when the fact already is at `target_version` or
    /// when `target_version` is `0` (no preference).
    #[must_use]
    pub fn is_transformation_necessary(fact: &Fact, target_version: u32) -> bool {
        target_version != 0 && fact.version() != target_version
    }

    /// Set form of [`Self::is_transformation_necessary`]: necessary only if
    /// no acceptable version is already satisfied.
    #[must_use]
    pub fn is_transformation_necessary_for(fact: &Fact, targets: &BTreeSet<u32>) -> bool {
        !targets.is_empty()
            && targets
                .iter()
                .all(|t| Self::is_transformation_necessary(fact, *t))
    }

    /// Finds the shortest step path from `from_version` to the nearest of
    /// `targets`.
    ///
    /// Among equally short paths to different targets the lowest target
    /// version wins; among equally short paths to the same target the one
    /// discovered first in registry order wins.
    ///
    /// # Errors
    ///
    /// Returns `TransformationError::NoChain` if no target is reachable and
    /// `TransformationError::Registry` if the registry fails.
    pub fn resolve(
        &self,
        key: &TransformationKey,
        from_version: u32,
        targets: &BTreeSet<u32>,
    ) -> Result<TransformationChain, TransformationError> {
        if targets.is_empty() || targets.contains(&0) || targets.contains(&from_version) {
            return Ok(TransformationChain::identity(key.clone(), from_version));
        }

        let steps = self.registry.transformations_for(key)?;
        let mut edges: FxHashMap<u32, Vec<usize>> = FxHashMap::default();
        for (idx, step) in steps.iter().enumerate() {
            edges.entry(step.from_version).or_default().push(idx);
        }

        let mut parent: FxHashMap<u32, usize> = FxHashMap::default();
        let mut visited: FxHashSet<u32> = FxHashSet::default();
        visited.insert(from_version);
        let mut frontier = VecDeque::from([from_version]);

        while !frontier.is_empty() {
            let mut next = VecDeque::new();
            for version in &frontier {
                for &idx in edges.get(version).map_or(&[][..], Vec::as_slice) {
                    let to = steps[idx].to_version;
                    if visited.insert(to) {
                        parent.insert(to, idx);
                        next.push_back(to);
                    }
                }
            }

            if let Some(target) = next.iter().copied().filter(|v| targets.contains(v)).min() {
                let path = walk_back(&steps, &parent, from_version, target);
                tracing::trace!(
                    key = %key,
                    from = from_version,
                    to = target,
                    steps = path.len(),
                    "resolved transformation chain"
                );
                return Ok(TransformationChain::new(key.clone(), from_version, path));
            }
            frontier = next;
        }

        Err(TransformationError::NoChain {
            key: key.clone(),
            from: from_version,
            targets: targets.iter().copied().collect(),
        })
    }
}

fn walk_back(
    steps: &[Transformation],
    parent: &FxHashMap<u32, usize>,
    from_version: u32,
    target: u32,
) -> Vec<Transformation> {
    let mut path = Vec::new();
    let mut at = target;
    while at != from_version {
        let Some(&idx) = parent.get(&at) else { break };
        path.push(steps[idx].clone());
        at = steps[idx].from_version;
    }
    path.reverse();
    path
}

impl std::fmt::Debug for TransformationChainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationChainResolver")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticTransformationRegistry;

    fn key() -> TransformationKey {
        TransformationKey::new("user", "created")
    }

    fn resolver(edges: &[(u32, u32)]) -> TransformationChainResolver {
        let registry = StaticTransformationRegistry::new();
        for (from, to) in edges {
            registry.add(Transformation::new(key(), *from, *to, None));
        }
        TransformationChainResolver::new(Arc::new(registry))
    }

    fn targets(versions: &[u32]) -> BTreeSet<u32> {
        versions.iter().copied().collect()
    }

    fn path(chain: &TransformationChain) -> Vec<(u32, u32)> {
        chain
            .steps()
            .iter()
            .map(|s| (s.from_version, s.to_version))
            .collect()
    }

    #[test]
    fn test_is_transformation_necessary() {
        let fact = Fact::builder().ns("user").type_("created").version(2).build();
        assert!(!TransformationChainResolver::is_transformation_necessary(&fact, 2));
        assert!(!TransformationChainResolver::is_transformation_necessary(&fact, 0));
        assert!(TransformationChainResolver::is_transformation_necessary(&fact, 3));

        assert!(!TransformationChainResolver::is_transformation_necessary_for(
            &fact,
            &targets(&[2, 3])
        ));
        assert!(TransformationChainResolver::is_transformation_necessary_for(
            &fact,
            &targets(&[1, 3])
        ));
        assert!(!TransformationChainResolver::is_transformation_necessary_for(
            &fact,
            &targets(&[])
        ));
    }

    #[test]
    fn test_shortest_path() {
        let r = resolver(&[(1, 2), (2, 3), (3, 4), (1, 3)]);
        let chain = r.resolve(&key(), 1, &targets(&[4])).unwrap();
        assert_eq!(path(&chain), vec![(1, 3), (3, 4)]);
        assert_eq!(chain.to_version(), 4);
    }

    #[test]
    fn test_downcast_path() {
        let r = resolver(&[(1, 2), (2, 3), (3, 2), (2, 1)]);
        let chain = r.resolve(&key(), 3, &targets(&[1])).unwrap();
        assert_eq!(path(&chain), vec![(3, 2), (2, 1)]);
    }

    #[test]
    fn test_nearest_target_wins() {
        let r = resolver(&[(1, 2), (2, 3), (3, 4)]);
        let chain = r.resolve(&key(), 1, &targets(&[4, 2])).unwrap();
        assert_eq!(chain.to_version(), 2);
    }

    #[test]
    fn test_tie_break_lowest_target() {
        let r = resolver(&[(2, 5), (2, 3)]);
        let chain = r.resolve(&key(), 2, &targets(&[5, 3])).unwrap();
        assert_eq!(chain.to_version(), 3);
    }

    #[test]
    fn test_identity_when_satisfied() {
        let r = resolver(&[(1, 2)]);
        let chain = r.resolve(&key(), 2, &targets(&[2, 1])).unwrap();
        assert!(chain.is_identity());
        let chain = r.resolve(&key(), 1, &targets(&[0])).unwrap();
        assert!(chain.is_identity());
    }

    #[test]
    fn test_unreachable_is_error() {
        let r = resolver(&[(1, 2)]);
        let err = r.resolve(&key(), 2, &targets(&[1])).unwrap_err();
        assert!(matches!(err, TransformationError::NoChain { from: 2, .. }));
    }

    #[test]
    fn test_resolution_is_stable() {
        let r = resolver(&[(1, 2), (2, 3), (1, 3)]);
        let a = r.resolve(&key(), 1, &targets(&[3])).unwrap();
        let b = r.resolve(&key(), 1, &targets(&[3])).unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_requested_versions() {
        let specs = vec![
            FactSpec::ns("user").with_type("created").with_version(3),
            FactSpec::ns("user").with_type("deleted"),
            FactSpec::ns("order").with_version(2),
        ];
        let requested = RequestedVersions::from_specs(&specs);

        let created = Fact::builder().ns("user").type_("created").version(1).build();
        assert_eq!(requested.targets_for(&created), Some(&targets(&[3])));

        let deleted = Fact::builder().ns("user").type_("deleted").version(1).build();
        assert_eq!(requested.targets_for(&deleted), None);

        let order = Fact::builder().ns("order").type_("placed").version(1).build();
        assert_eq!(requested.targets_for(&order), None);
        assert!(!requested.is_empty());
        assert!(RequestedVersions::from_specs(&[FactSpec::ns("user")]).is_empty());
    }
}
