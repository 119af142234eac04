//! Downstream consumer seam and the order-preserving transforming front.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use fxhash::FxHashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::TransformationConfig;
use crate::fact::{Fact, FactSpec};

use super::resolver::{RequestedVersions, TransformationChainResolver};
use super::transformer::{FactTransformer, PendingTransformation};
use super::TransformationError;

/// Receiver of delivered facts.
///
/// `None` is the batch-boundary marker: everything accepted before it has
/// been delivered in order.
#[async_trait]
pub trait FactConsumer: Send {
    /// Accepts the next fact or a batch boundary.
    ///
    /// # Errors
    ///
    /// Any error ends the surrounding subscription.
    async fn accept(&mut self, fact: Option<Fact>) -> crate::Result<()>;
}

/// Operating state of a [`TransformingConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    /// Facts are forwarded immediately. Initial state.
    Direct,
    /// Facts are queued and delivered on flush.
    Buffering,
}

type PendingResult = Shared<BoxFuture<'static, Result<Fact, TransformationError>>>;

enum BufferEntry {
    Ready(Fact),
    Pending { id: Uuid, result: PendingResult },
}

/// Applies transformations between storage and a downstream consumer
/// without reordering facts.
///
/// Starts in [`ConsumerMode::Direct`] and switches to
/// [`ConsumerMode::Buffering`] on the first fact that needs
/// transformation. Not meant for concurrent producers: one task feeds it
/// in order.
pub struct TransformingConsumer<C> {
    transformer: FactTransformer,
    requested: RequestedVersions,
    downstream: C,
    config: TransformationConfig,
    mode: ConsumerMode,
    buffer: Vec<BufferEntry>,
    /// `(fact id, chain id)` to its pending result.
    index: FxHashMap<(Uuid, String), PendingResult>,
    requests: Vec<PendingTransformation>,
}

impl<C: FactConsumer> TransformingConsumer<C> {
    /// Creates a consumer delivering to `downstream` at the versions the
    /// `specs` request.
    #[must_use]
    pub fn new(
        transformer: FactTransformer,
        specs: &[FactSpec],
        downstream: C,
        config: TransformationConfig,
    ) -> Self {
        Self {
            transformer,
            requested: RequestedVersions::from_specs(specs),
            downstream,
            config,
            mode: ConsumerMode::Direct,
            buffer: Vec::new(),
            index: FxHashMap::default(),
            requests: Vec::new(),
        }
    }

    /// Returns the current mode.
    #[must_use]
    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    /// Number of buffered entries awaiting flush.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the downstream consumer.
    #[must_use]
    pub fn downstream(&self) -> &C {
        &self.downstream
    }

    /// Consumes the front, returning the downstream consumer.
    #[must_use]
    pub fn into_downstream(self) -> C {
        self.downstream
    }

    fn targets(&self, fact: &Fact) -> Option<BTreeSet<u32>> {
        self.requested
            .targets_for(fact)
            .filter(|targets| {
                TransformationChainResolver::is_transformation_necessary_for(fact, targets)
            })
            .cloned()
    }

    async fn accept_direct(&mut self, fact: Fact) -> crate::Result<()> {
        if self.targets(&fact).is_none() {
            return self.downstream.accept(Some(fact)).await;
        }
        tracing::debug!(id = %fact.id(), "switching to buffering mode");
        self.mode = ConsumerMode::Buffering;
        self.accept_buffering(fact).await
    }

    async fn accept_buffering(&mut self, fact: Fact) -> crate::Result<()> {
        let targets = self.targets(&fact);
        self.enqueue(fact, targets.as_ref())?;
        if self.buffer.len() >= self.config.buffer_capacity {
            self.flush().await?;
        }
        Ok(())
    }

    fn enqueue(
        &mut self,
        fact: Fact,
        targets: Option<&BTreeSet<u32>>,
    ) -> Result<(), TransformationError> {
        let Some(targets) = targets else {
            self.buffer.push(BufferEntry::Ready(fact));
            return Ok(());
        };
        let chain = self.transformer.resolve(&fact, targets)?;
        if chain.is_identity() {
            self.buffer.push(BufferEntry::Ready(fact));
            return Ok(());
        }

        let id = fact.id();
        let slot = (id, chain.id().to_string());
        if let Some(result) = self.index.get(&slot) {
            let result = result.clone();
            self.buffer.push(BufferEntry::Pending { id, result });
            return Ok(());
        }

        let (reply, receiver) = oneshot::channel();
        let result = async move {
            receiver
                .await
                .unwrap_or(Err(TransformationError::Cancelled(id)))
        }
        .boxed()
        .shared();
        self.requests.push(PendingTransformation {
            fact,
            chain: Arc::new(chain),
            reply,
        });
        self.index.insert(slot, result.clone());
        self.buffer.push(BufferEntry::Pending { id, result });
        Ok(())
    }

    /// Resolves every pending transformation and delivers the buffer in
    /// arrival order, followed by a batch boundary.
    ///
    /// Transformations run on a spawned task; each buffered entry is
    /// awaited for at most `flush_wait`. Delivery stops at the first
    /// failed entry, whose error is returned; transformations of other
    /// entries still complete and are cached.
    ///
    /// # Errors
    ///
    /// Returns the first transformation error in buffer order, or any
    /// downstream error.
    pub async fn flush(&mut self) -> crate::Result<()> {
        self.transformer
            .metrics()
            .flushes
            .fetch_add(1, Ordering::Relaxed);

        let requests = std::mem::take(&mut self.requests);
        let entries = std::mem::take(&mut self.buffer);
        self.index.clear();
        tracing::debug!(
            entries = entries.len(),
            pending = requests.len(),
            "flushing transformation buffer"
        );
        if !requests.is_empty() {
            tokio::spawn(self.transformer.clone().run_batch(requests));
        }

        for entry in entries {
            let fact = match entry {
                BufferEntry::Ready(fact) => fact,
                BufferEntry::Pending { id, result } => {
                    match tokio::time::timeout(self.config.flush_wait, result).await {
                        Ok(resolved) => resolved?,
                        Err(_) => return Err(TransformationError::Timeout(id).into()),
                    }
                }
            };
            self.downstream.accept(Some(fact)).await?;
        }
        self.downstream.accept(None).await
    }
}

#[async_trait]
impl<C: FactConsumer> FactConsumer for TransformingConsumer<C> {
    async fn accept(&mut self, fact: Option<Fact>) -> crate::Result<()> {
        match (fact, self.mode) {
            (Some(fact), ConsumerMode::Direct) => self.accept_direct(fact).await,
            (Some(fact), ConsumerMode::Buffering) => self.accept_buffering(fact).await,
            (None, ConsumerMode::Direct) => self.downstream.accept(None).await,
            (None, ConsumerMode::Buffering) => self.flush().await,
        }
    }
}

impl<C> std::fmt::Debug for TransformingConsumer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformingConsumer")
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.requests.len())
            .finish_non_exhaustive()
    }
}
