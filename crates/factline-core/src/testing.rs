//! Testing utilities for pipeline components.
//!
//! In-memory implementations of every seam the pipeline talks to (script
//! engine, registries, durable store, pub/sub) plus a collecting consumer,
//! for unit and integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::blacklist::BlacklistSource;
use crate::cache::{CacheKey, StoreError, TransformationStore};
use crate::channel::{ChannelError, PubSubConnection, PubSubConnector};
use crate::fact::Fact;
use crate::script::{CompiledScript, ScriptEngine, ScriptError, ScriptHandle};
use crate::signal::{channel_names, RawNotification};
use crate::transform::{FactConsumer, RegistryError, Transformation, TransformationKey, TransformationRegistry};

/// Polls `condition` every millisecond until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(condition(), "condition not met within 5s");
}

// ---------------------------------------------------------------------------
// Scripting
// ---------------------------------------------------------------------------

type ScriptFn = Arc<dyn Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync>;

/// Script engine backed by registered Rust closures.
///
/// A "source" is just a name; compiling an unregistered name fails.
#[derive(Default)]
pub struct FnScriptEngine {
    sources: RwLock<FxHashMap<String, FxHashMap<String, ScriptFn>>>,
    compiles: AtomicUsize,
}

impl FnScriptEngine {
    /// Creates an engine with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` of script `source`.
    pub fn register<F>(&self, source: &str, function: &str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        self.sources
            .write()
            .entry(source.to_string())
            .or_default()
            .insert(function.to_string(), Arc::new(f));
    }

    /// Number of successful compilations.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl ScriptEngine for FnScriptEngine {
    fn compile(&self, source: &str) -> Result<ScriptHandle, ScriptError> {
        let functions = self
            .sources
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| ScriptError::Compile(format!("unknown script '{source}'")))?;
        self.compiles.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(FnScript { functions }))
    }
}

impl std::fmt::Debug for FnScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnScriptEngine")
            .field("sources", &self.sources.read().len())
            .field("compiles", &self.compile_count())
            .finish()
    }
}

struct FnScript {
    functions: FxHashMap<String, ScriptFn>,
}

impl CompiledScript for FnScript {
    fn invoke(&self, function: &str, args: &[Value]) -> Result<Value, ScriptError> {
        let f = self.functions.get(function).ok_or_else(|| ScriptError::Invoke {
            function: function.to_string(),
            message: "no such function".to_string(),
        })?;
        f(args)
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Blacklist source over an in-memory set.
#[derive(Debug, Default)]
pub struct StaticBlacklistSource {
    ids: Mutex<HashSet<Uuid>>,
    fail_next: Mutex<Option<String>>,
}

impl StaticBlacklistSource {
    /// Creates a source blocking `ids`.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            ids: Mutex::new(ids.into_iter().collect()),
            fail_next: Mutex::new(None),
        }
    }

    /// Replaces the blocked set.
    pub fn set(&self, ids: impl IntoIterator<Item = Uuid>) {
        *self.ids.lock() = ids.into_iter().collect();
    }

    /// Makes the next fetch fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl BlacklistSource for StaticBlacklistSource {
    async fn blocked_ids(&self) -> Result<HashSet<Uuid>, RegistryError> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(RegistryError::Unavailable(message));
        }
        Ok(self.ids.lock().clone())
    }
}

/// Transformation registry over an in-memory step list.
#[derive(Debug, Default)]
pub struct StaticTransformationRegistry {
    steps: RwLock<FxHashMap<TransformationKey, Vec<Transformation>>>,
    invalidations: Mutex<FxHashMap<TransformationKey, usize>>,
}

impl StaticTransformationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one step.
    pub fn add(&self, step: Transformation) {
        self.steps.write().entry(step.key.clone()).or_default().push(step);
    }

    /// How often `key` was invalidated.
    #[must_use]
    pub fn invalidations(&self, key: &TransformationKey) -> usize {
        self.invalidations.lock().get(key).copied().unwrap_or(0)
    }
}

impl TransformationRegistry for StaticTransformationRegistry {
    fn transformations_for(&self, key: &TransformationKey) -> Result<Vec<Transformation>, RegistryError> {
        Ok(self.steps.read().get(key).cloned().unwrap_or_default())
    }

    fn invalidate(&self, key: &TransformationKey) {
        *self.invalidations.lock().entry(key.clone()).or_insert(0) += 1;
    }
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// Transformation store over an in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryTransformationStore {
    rows: Mutex<FxHashMap<CacheKey, (Fact, DateTime<Utc>)>>,
    failing: AtomicBool,
}

impl InMemoryTransformationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Last access time of one row.
    #[must_use]
    pub fn last_access(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.rows.lock().get(key).map(|(_, at)| *at)
    }

    /// Makes every operation fail while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn delete_where(&self, pred: impl Fn(&CacheKey, &Fact, DateTime<Utc>) -> bool) -> u64 {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|key, (fact, at)| !pred(key, fact, *at));
        (before - rows.len()) as u64
    }
}

#[async_trait]
impl TransformationStore for InMemoryTransformationStore {
    async fn find(&self, key: &CacheKey) -> Result<Option<Fact>, StoreError> {
        self.check()?;
        Ok(self.rows.lock().get(key).map(|(fact, _)| fact.clone()))
    }

    async fn find_all(&self, keys: &[CacheKey]) -> Result<Vec<(CacheKey, Fact)>, StoreError> {
        self.check()?;
        let rows = self.rows.lock();
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(key).map(|(fact, _)| (key.clone(), fact.clone())))
            .collect())
    }

    async fn touch(&self, keys: &[CacheKey], at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock();
        for key in keys {
            if let Some((_, last)) = rows.get_mut(key) {
                *last = at;
            }
        }
        Ok(())
    }

    async fn upsert(&self, entries: &[(CacheKey, Fact)], at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock();
        for (key, fact) in entries {
            rows.insert(key.clone(), (fact.clone(), at));
        }
        Ok(())
    }

    async fn delete_for_fact(&self, fact_id: Uuid) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.delete_where(|key, _, _| key.fact_id() == fact_id))
    }

    async fn delete_for_key(&self, key: &TransformationKey) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.delete_where(|_, fact, _| {
            fact.ns() == key.ns && fact.type_() == Some(key.type_.as_str())
        }))
    }

    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.delete_where(|_, _, at| at < threshold))
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Consumer that records everything it receives.
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    facts: Vec<Fact>,
    boundaries: usize,
}

impl CollectingConsumer {
    /// Creates an empty consumer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Facts received so far, in order.
    #[must_use]
    pub fn facts(&self) -> Vec<Fact> {
        self.facts.clone()
    }

    /// Number of `None` boundary markers received.
    #[must_use]
    pub fn boundaries(&self) -> usize {
        self.boundaries
    }
}

#[async_trait]
impl FactConsumer for CollectingConsumer {
    async fn accept(&mut self, fact: Option<Fact>) -> crate::Result<()> {
        match fact {
            Some(fact) => self.facts.push(fact),
            None => self.boundaries += 1,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pub/sub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Broker {
    next_id: u64,
    connections: FxHashMap<u64, mpsc::UnboundedSender<RawNotification>>,
}

/// In-process publish/subscribe broker.
///
/// Every notification reaches every open connection. Round-trip probes
/// are echoed unless disabled with [`InMemoryPubSub::set_echo_roundtrip`].
pub struct InMemoryPubSub {
    broker: Arc<Mutex<Broker>>,
    connects: AtomicU64,
    failing_connects: AtomicUsize,
    echo_roundtrip: Arc<AtomicBool>,
}

impl InMemoryPubSub {
    /// Creates a broker with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Mutex::new(Broker::default())),
            connects: AtomicU64::new(0),
            failing_connects: AtomicUsize::new(0),
            echo_roundtrip: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Delivers one notification to every open connection.
    pub fn publish(&self, notification: RawNotification) {
        broadcast(&self.broker, &notification);
    }

    /// Delivers notifications in order to every open connection.
    pub fn publish_all(&self, notifications: Vec<RawNotification>) {
        for notification in &notifications {
            broadcast(&self.broker, notification);
        }
    }

    /// Severs every open connection.
    pub fn drop_connections(&self) {
        self.broker.lock().connections.clear();
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Makes the next `n` connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::Relaxed);
    }

    /// Enables or disables echoing round-trip probes.
    pub fn set_echo_roundtrip(&self, echo: bool) {
        self.echo_roundtrip.store(echo, Ordering::Relaxed);
    }

    /// Number of open connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.broker.lock().connections.len()
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPubSub")
            .field("connects", &self.connect_count())
            .field("active", &self.active_connections())
            .finish_non_exhaustive()
    }
}

fn broadcast(broker: &Mutex<Broker>, notification: &RawNotification) {
    for tx in broker.lock().connections.values() {
        // A closed receiver is removed on close or drop.
        let _ = tx.send(notification.clone());
    }
}

#[async_trait]
impl PubSubConnector for InMemoryPubSub {
    async fn connect(&self) -> Result<Box<dyn PubSubConnection>, ChannelError> {
        let failing = self
            .failing_connects
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut broker = self.broker.lock();
            broker.next_id += 1;
            let id = broker.next_id;
            broker.connections.insert(id, tx);
            id
        };
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(InMemoryConnection {
            id,
            rx,
            broker: Arc::clone(&self.broker),
            echo_roundtrip: Arc::clone(&self.echo_roundtrip),
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    rx: mpsc::UnboundedReceiver<RawNotification>,
    broker: Arc<Mutex<Broker>>,
    echo_roundtrip: Arc<AtomicBool>,
}

#[async_trait]
impl PubSubConnection for InMemoryConnection {
    async fn subscribe(&mut self, _channels: &[&str]) -> Result<(), ChannelError> {
        if self.broker.lock().connections.contains_key(&self.id) {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<RawNotification>, ChannelError> {
        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(first)) => first,
            Ok(None) => return Err(ChannelError::Closed),
            Err(_) => return Ok(Vec::new()),
        };
        let mut batch = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        Ok(batch)
    }

    async fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<(), ChannelError> {
        if !self.broker.lock().connections.contains_key(&self.id) {
            return Err(ChannelError::Closed);
        }
        if channel == channel_names::ROUNDTRIP && !self.echo_roundtrip.load(Ordering::Relaxed) {
            return Ok(());
        }
        let notification = RawNotification {
            channel: channel.to_string(),
            payload: payload.map(str::to_string),
        };
        broadcast(&self.broker, &notification);
        Ok(())
    }

    async fn close(&mut self) {
        self.broker.lock().connections.remove(&self.id);
        self.rx.close();
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.broker.lock().connections.remove(&self.id);
    }
}
