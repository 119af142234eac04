//! End-to-end scenarios: store notifications through the change bus into
//! the blacklist, filter, caches and transforming consumer.

use std::sync::{Arc, Once};
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use factline_core::blacklist::Blacklist;
use factline_core::cache::{
    CacheKey, InMemoryTransformationCache, PersistentTransformationCache, TransformationCache,
    TransformationStore,
};
use factline_core::channel::{NotificationChannel, PubSubConnector};
use factline_core::config::{CacheConfig, NotificationConfig, TransformationConfig};
use factline_core::filter::FactFilter;
use factline_core::invalidation::register_invalidation;
use factline_core::script::{ScriptCache, ScriptEngine};
use factline_core::signal::{channel_names, LocalChangeBus, RawNotification};
use factline_core::testing::{
    wait_until, CollectingConsumer, FnScriptEngine, InMemoryPubSub, InMemoryTransformationStore,
    StaticBlacklistSource, StaticTransformationRegistry,
};
use factline_core::transform::{
    FactConsumer, FactTransformer, Transformation, TransformationKey, TransformationRegistry,
    TransformingConsumer,
};
use factline_core::{ChangeBus, Fact, FactSpec};

static LOGGING: Once = Once::new();

/// Sends pipeline logs to the test writer. `RUST_LOG` overrides the level.
fn init_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn fast_notifications() -> NotificationConfig {
    NotificationConfig {
        receive_timeout: Duration::from_millis(20),
        roundtrip_timeout: Duration::from_millis(50),
        reconnect_backoff: Duration::from_millis(5),
        startup_grace: Duration::from_secs(2),
    }
}

fn user_fact(version: u32) -> Fact {
    Fact::builder()
        .ns("user")
        .type_("created")
        .version(version)
        .payload_json(&json!({"name": "ada"}))
        .build()
}

fn upgrading_engine() -> Arc<FnScriptEngine> {
    let engine = Arc::new(FnScriptEngine::new());
    engine.register("v1-v2", "transform", |args| {
        let mut payload = args[0].clone();
        payload["displayName"] = payload["name"].clone();
        Ok(payload)
    });
    engine
}

struct Pipeline {
    pubsub: Arc<InMemoryPubSub>,
    bus: Arc<LocalChangeBus>,
    channel: NotificationChannel,
}

async fn start_pipeline() -> Pipeline {
    init_logging();
    let pubsub = Arc::new(InMemoryPubSub::new());
    let bus = Arc::new(LocalChangeBus::new());
    let channel = NotificationChannel::new(
        Arc::clone(&pubsub) as Arc<dyn PubSubConnector>,
        Arc::clone(&bus) as Arc<dyn ChangeBus>,
        fast_notifications(),
    );
    channel.start().await.unwrap();
    Pipeline {
        pubsub,
        bus,
        channel,
    }
}

#[tokio::test]
async fn test_blacklisted_fact_is_never_delivered() {
    let p = start_pipeline().await;
    let blocked = user_fact(1);
    let allowed = user_fact(1);

    let source = Arc::new(StaticBlacklistSource::new(Vec::<Uuid>::new()));
    let blacklist = Arc::new(Blacklist::new(Arc::clone(&source) as _));
    blacklist.start(p.bus.as_ref()).await.unwrap();
    assert!(!blacklist.is_blocked(blocked.id()));

    // The store blocks a fact and announces it.
    source.set([blocked.id()]);
    p.pubsub
        .publish(RawNotification::new(channel_names::BLACKLIST_CHANGE));
    wait_until(|| blacklist.is_blocked(blocked.id())).await;

    let specs = vec![FactSpec::ns("user").with_type("*")];
    let scripts = ScriptCache::new(Arc::new(FnScriptEngine::new()) as Arc<dyn ScriptEngine>);
    let filter = FactFilter::new(&specs, Arc::clone(&blacklist), &scripts).unwrap();

    let transformer = FactTransformer::new(
        Arc::new(StaticTransformationRegistry::new()),
        Arc::new(scripts),
        Arc::new(InMemoryTransformationCache::new(10)),
    );
    let mut consumer = TransformingConsumer::new(
        transformer,
        &specs,
        CollectingConsumer::new(),
        TransformationConfig::default(),
    );

    for fact in [blocked.clone(), allowed.clone()] {
        if filter.test(&fact).unwrap() {
            consumer.accept(Some(fact)).await.unwrap();
        }
    }
    consumer.accept(None).await.unwrap();

    let delivered = consumer.downstream().facts();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id(), allowed.id());
    assert_eq!(consumer.downstream().boundaries(), 1);

    p.channel.stop().await;
}

#[tokio::test]
async fn test_mixed_batch_keeps_order_and_fills_durable_cache() {
    init_logging();
    let registry = Arc::new(StaticTransformationRegistry::new());
    registry.add(Transformation::new(
        TransformationKey::new("user", "created"),
        1,
        2,
        Some("v1-v2".into()),
    ));
    let store = Arc::new(InMemoryTransformationStore::new());
    let cache = Arc::new(PersistentTransformationCache::new(
        Arc::clone(&store) as Arc<dyn TransformationStore>
    ));
    let scripts = Arc::new(ScriptCache::new(upgrading_engine() as Arc<dyn ScriptEngine>));
    let transformer = FactTransformer::new(
        Arc::clone(&registry) as Arc<dyn TransformationRegistry>,
        scripts,
        Arc::clone(&cache) as Arc<dyn TransformationCache>,
    );
    let metrics = Arc::clone(transformer.metrics());

    let specs = vec![
        FactSpec::ns("user").with_type("created").with_version(2),
        FactSpec::ns("audit"),
    ];
    let mut consumer = TransformingConsumer::new(
        transformer,
        &specs,
        CollectingConsumer::new(),
        TransformationConfig::default(),
    );

    let a = user_fact(1);
    let b = Fact::builder().ns("audit").type_("login").version(1).build();
    let c = user_fact(1);
    for fact in [&a, &b, &c] {
        consumer.accept(Some(fact.clone())).await.unwrap();
    }
    consumer.accept(None).await.unwrap();

    let delivered = consumer.downstream().facts();
    let ids: Vec<Uuid> = delivered.iter().map(Fact::id).collect();
    assert_eq!(ids, vec![a.id(), b.id(), c.id()]);
    assert_eq!(delivered[0].version(), 2);
    assert_eq!(delivered[0].payload_value().unwrap()["displayName"], json!("ada"));
    assert_eq!(delivered[1].version(), 1);
    assert_eq!(delivered[2].version(), 2);
    assert_eq!(store.len(), 2);

    // A second subscription over the same facts is served from the store.
    let transformer = FactTransformer::new(
        registry,
        Arc::new(ScriptCache::new(upgrading_engine() as Arc<dyn ScriptEngine>)),
        cache,
    );
    let second = Arc::clone(transformer.metrics());
    let mut consumer = TransformingConsumer::new(
        transformer,
        &specs,
        CollectingConsumer::new(),
        TransformationConfig::default(),
    );
    consumer.accept(Some(a.clone())).await.unwrap();
    consumer.accept(None).await.unwrap();

    assert_eq!(consumer.downstream().facts()[0].version(), 2);
    assert_eq!(second.cache_hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert!(metrics.flushes.load(std::sync::atomic::Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn test_update_notification_invalidates_twice() {
    let p = start_pipeline().await;
    let cache = Arc::new(InMemoryTransformationCache::new(100));
    let registry = Arc::new(StaticTransformationRegistry::new());
    let config = CacheConfig {
        invalidation_delay: Duration::from_millis(100),
        ..CacheConfig::default()
    };
    register_invalidation(
        p.bus.as_ref(),
        Arc::clone(&cache) as Arc<dyn TransformationCache>,
        Arc::clone(&registry) as Arc<dyn TransformationRegistry>,
        &config,
    );

    let stale = user_fact(2);
    let key = CacheKey::of(&stale, "chain");
    cache.put(stale.clone(), "chain").await;

    p.pubsub.publish(RawNotification::with_payload(
        channel_names::FACT_UPDATE,
        json!({"id": stale.id()}).to_string(),
    ));
    wait_until(|| cache.is_empty()).await;

    // Written by a transformation that started before the update.
    cache.put(stale.clone(), "chain").await;
    assert!(cache.find(&key).await.is_some());
    wait_until(|| cache.is_empty()).await;

    p.channel.stop().await;
}

#[tokio::test]
async fn test_transformation_change_notification_invalidates_key() {
    let p = start_pipeline().await;
    let cache = Arc::new(InMemoryTransformationCache::new(100));
    let registry = Arc::new(StaticTransformationRegistry::new());
    register_invalidation(
        p.bus.as_ref(),
        Arc::clone(&cache) as Arc<dyn TransformationCache>,
        Arc::clone(&registry) as Arc<dyn TransformationRegistry>,
        &CacheConfig::default(),
    );

    cache.put(user_fact(2), "chain").await;
    cache
        .put(
            Fact::builder().ns("order").type_("placed").version(2).build(),
            "chain",
        )
        .await;

    p.pubsub.publish(RawNotification::with_payload(
        channel_names::TRANSFORMATION_CHANGE,
        r#"{"ns":"user","type":"created"}"#,
    ));
    wait_until(|| cache.len() == 1).await;
    assert_eq!(
        registry.invalidations(&TransformationKey::new("user", "created")),
        1
    );

    p.channel.stop().await;
}
