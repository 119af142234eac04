//! Runs transformation chains, consulting the transformation cache.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use tokio::sync::oneshot;

use crate::cache::{CacheKey, TransformationCache};
use crate::fact::{Fact, FactError};
use crate::script::ScriptCache;

use super::chain::{TransformationChain, TransformationKey};
use super::registry::TransformationRegistry;
use super::resolver::TransformationChainResolver;
use super::TransformationError;

/// Entry point a transformation script must expose.
const TRANSFORM_FUNCTION: &str = "transform";

/// Counters for transformation work.
#[derive(Debug, Default)]
pub struct TransformerMetrics {
    /// Facts run through a script chain.
    pub transformed: AtomicU64,
    /// Requests answered from the cache.
    pub cache_hits: AtomicU64,
    /// Requests that had to be computed.
    pub cache_misses: AtomicU64,
    /// Requests that failed.
    pub failures: AtomicU64,
    /// Buffer flushes performed by transforming consumers.
    pub flushes: AtomicU64,
}

impl TransformerMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// One queued transformation and the slot its result goes to.
pub(crate) struct PendingTransformation {
    pub(crate) fact: Fact,
    pub(crate) chain: Arc<TransformationChain>,
    pub(crate) reply: oneshot::Sender<Result<Fact, TransformationError>>,
}

impl PendingTransformation {
    fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.fact.id(), self.chain.to_version(), self.chain.id())
    }

    fn resolve(self, result: Result<Fact, TransformationError>) {
        // The consumer may have given up on this entry already.
        let _ = self.reply.send(result);
    }
}

/// Applies [`TransformationChain`]s to facts.
///
/// Cheap to clone; clones share the resolver, script cache, transformation
/// cache and metrics.
#[derive(Clone)]
pub struct FactTransformer {
    resolver: Arc<TransformationChainResolver>,
    scripts: Arc<ScriptCache>,
    cache: Arc<dyn TransformationCache>,
    metrics: Arc<TransformerMetrics>,
}

impl FactTransformer {
    /// Creates a transformer.
    #[must_use]
    pub fn new(
        registry: Arc<dyn TransformationRegistry>,
        scripts: Arc<ScriptCache>,
        cache: Arc<dyn TransformationCache>,
    ) -> Self {
        Self {
            resolver: Arc::new(TransformationChainResolver::new(registry)),
            scripts,
            cache,
            metrics: Arc::new(TransformerMetrics::new()),
        }
    }

    /// Returns the chain resolver.
    #[must_use]
    pub fn resolver(&self) -> &TransformationChainResolver {
        &self.resolver
    }

    /// Returns the transformation cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn TransformationCache> {
        &self.cache
    }

    /// Returns the shared counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<TransformerMetrics> {
        &self.metrics
    }

    /// Resolves the chain taking `fact` to the nearest of `targets`.
    /// Untyped facts always get the identity chain.
    ///
    /// # Errors
    ///
    /// See [`TransformationChainResolver::resolve`].
    pub fn resolve(
        &self,
        fact: &Fact,
        targets: &BTreeSet<u32>,
    ) -> Result<TransformationChain, TransformationError> {
        match TransformationKey::of(fact) {
            Some(key) => self.resolver.resolve(&key, fact.version(), targets),
            None => Ok(TransformationChain::identity(
                TransformationKey::new(fact.ns(), ""),
                fact.version(),
            )),
        }
    }

    /// Runs `chain` over `fact` through the script engine.
    ///
    /// Each step with a script gets the current payload passed to its
    /// `transform` function and returns the next payload. Blocking; call
    /// from a blocking context when used inside a runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransformationError::Script` if a step fails and
    /// `TransformationError::Fact` if the payload cannot be decoded.
    pub fn apply(
        &self,
        fact: &Fact,
        chain: &TransformationChain,
    ) -> Result<Fact, TransformationError> {
        apply_chain(&self.scripts, fact, chain)
    }

    /// Transforms a single fact to the nearest of `targets`, using and
    /// filling the cache. Returns the fact unchanged if no transformation
    /// is necessary.
    ///
    /// # Errors
    ///
    /// Returns `TransformationError` if resolution or a script fails.
    pub async fn transform(
        &self,
        fact: Fact,
        targets: &BTreeSet<u32>,
    ) -> Result<Fact, TransformationError> {
        if !TransformationChainResolver::is_transformation_necessary_for(&fact, targets) {
            return Ok(fact);
        }
        let chain = Arc::new(self.resolve(&fact, targets)?);
        if chain.is_identity() {
            return Ok(fact);
        }

        let (reply, result) = oneshot::channel();
        let id = fact.id();
        self.clone()
            .run_batch(vec![PendingTransformation { fact, chain, reply }])
            .await;
        result
            .await
            .unwrap_or(Err(TransformationError::Cancelled(id)))
    }

    /// Resolves a batch of pending transformations.
    ///
    /// One batched cache lookup covers every request; misses are grouped
    /// by `(chain id, key)`. More than one group runs in parallel on the
    /// blocking pool, one task per group; a single group runs sequentially
    /// in one task so one warm script is not contended. A failure fails
    /// the rest of its group only. Successes are written back to the cache.
    pub(crate) async fn run_batch(self, requests: Vec<PendingTransformation>) {
        if requests.is_empty() {
            return;
        }
        let keys: Vec<CacheKey> = requests.iter().map(PendingTransformation::cache_key).collect();
        let mut hits = self.cache.find_all(&keys).await;

        let mut groups: Vec<Vec<PendingTransformation>> = Vec::new();
        let mut group_of: FxHashMap<(String, TransformationKey), usize> = FxHashMap::default();
        for (request, key) in requests.into_iter().zip(keys) {
            if let Some(hit) = hits.remove(&key) {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                request.resolve(Ok(hit));
                continue;
            }
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
            let group_key = (request.chain.id().to_string(), request.chain.key().clone());
            let idx = *group_of.entry(group_key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[idx].push(request);
        }

        if groups.is_empty() {
            return;
        }
        tracing::debug!(groups = groups.len(), "running transformation batch");

        let parallel = groups.len() > 1;
        let tasks: Vec<_> = if parallel {
            groups
                .into_iter()
                .map(|group| {
                    let this = self.clone();
                    tokio::task::spawn_blocking(move || this.run_group(group))
                })
                .collect()
        } else {
            let this = self.clone();
            vec![tokio::task::spawn_blocking(move || {
                groups
                    .into_iter()
                    .flat_map(|g| this.run_group(g))
                    .collect::<Vec<_>>()
            })]
        };

        let mut computed = Vec::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(done) => computed.extend(done),
                Err(e) => tracing::error!(error = %e, "transformation task panicked"),
            }
        }
        self.cache.put_all(computed).await;
    }

    /// Runs one chain group in order, returning `(fact, chain id)` for every
    /// success.
    fn run_group(&self, group: Vec<PendingTransformation>) -> Vec<(Fact, String)> {
        let mut done = Vec::with_capacity(group.len());
        let mut failed: Option<TransformationError> = None;

        for request in group {
            if let Some(err) = &failed {
                request.resolve(Err(err.clone()));
                continue;
            }
            match apply_chain(&self.scripts, &request.fact, &request.chain) {
                Ok(fact) => {
                    self.metrics.transformed.fetch_add(1, Ordering::Relaxed);
                    done.push((fact.clone(), request.chain.id().to_string()));
                    request.resolve(Ok(fact));
                }
                Err(e) => {
                    self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        id = %request.fact.id(),
                        chain = request.chain.id(),
                        error = %e,
                        "transformation failed"
                    );
                    failed = Some(e.clone());
                    request.resolve(Err(e));
                }
            }
        }
        done
    }
}

fn apply_chain(
    scripts: &ScriptCache,
    fact: &Fact,
    chain: &TransformationChain,
) -> Result<Fact, TransformationError> {
    if chain.is_identity() {
        return Ok(fact.clone());
    }

    let script_error = |source| TransformationError::Script {
        id: fact.id(),
        source,
    };
    let mut payload = fact.payload_value()?;
    for step in chain.steps() {
        let Some(source) = &step.script else { continue };
        let handle = scripts.get_or_compile(source).map_err(script_error)?;
        payload = handle
            .invoke(TRANSFORM_FUNCTION, std::slice::from_ref(&payload))
            .map_err(script_error)?;
    }

    let bytes = serde_json::to_vec(&payload).map_err(|e| FactError::Encoding(e.to_string()))?;
    Ok(fact.with_version_and_payload(chain.to_version(), bytes))
}

impl std::fmt::Debug for FactTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactTransformer")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}
