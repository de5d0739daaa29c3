/// End-to-end resolver behaviour over in-process origins
use async_trait::async_trait;
use chrono::Duration;
use federation_metadata::{
    clock::ManualClock,
    criteria::{CriteriaSet, Criterion},
    error::{MetadataError, MetadataResult},
    fetch::{OriginFetcher, StaticDocumentSource},
    filter::{FilterChain, MetadataFilter, RequiredValidUntilFilter},
    index::builtin::entity_id_source_id,
    metadata::{EntitiesDescriptor, EntityDescriptor, MetadataDocument, RoleDescriptor, RoleType},
    store::{
        persistent::sha256_entity_id_key, FilesystemCacheManager, MetadataResolver, Persistence,
        PersistentCacheManager, RefreshFailurePolicy, ResolverConfig,
    },
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

const SAML2_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";

fn idp(entity_id: &str) -> EntityDescriptor {
    EntityDescriptor::new(entity_id).with_role(RoleDescriptor::new(RoleType::IdpSso, SAML2_PROTOCOL))
}

fn sp(entity_id: &str) -> EntityDescriptor {
    EntityDescriptor::new(entity_id).with_role(RoleDescriptor::new(RoleType::SpSso, SAML2_PROTOCOL))
}

fn by_id(entity_id: &str) -> CriteriaSet {
    CriteriaSet::for_entity_id(entity_id).unwrap()
}

/// Per-query origin backed by a mutable map, counting every fetch
#[derive(Default)]
struct ScriptedOrigin {
    entities: Mutex<HashMap<String, EntityDescriptor>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
    latency_ms: u64,
}

impl ScriptedOrigin {
    fn with(descriptors: Vec<EntityDescriptor>) -> Arc<Self> {
        let origin = Self::default();
        origin.set(descriptors);
        Arc::new(origin)
    }

    fn slow(descriptors: Vec<EntityDescriptor>, latency_ms: u64) -> Arc<Self> {
        let origin = Self {
            latency_ms,
            ..Self::default()
        };
        origin.set(descriptors);
        Arc::new(origin)
    }

    fn set(&self, descriptors: Vec<EntityDescriptor>) {
        let mut entities = self.entities.lock().unwrap();
        entities.clear();
        for d in descriptors {
            entities.insert(d.entity_id.clone(), d);
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl OriginFetcher for ScriptedOrigin {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, criteria: &CriteriaSet) -> MetadataResult<Option<MetadataDocument>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MetadataError::FetchFailed("origin unavailable".to_string()));
        }
        let Some(entity_id) = criteria.entity_id() else {
            return Ok(None);
        };
        Ok(self
            .entities
            .lock()
            .unwrap()
            .get(entity_id)
            .cloned()
            .map(MetadataDocument::Entity))
    }
}

async fn dynamic_resolver(
    origin: Arc<ScriptedOrigin>,
    clock: Arc<ManualClock>,
    config: ResolverConfig,
) -> Arc<MetadataResolver> {
    let resolver = MetadataResolver::builder("dynamic", origin)
        .clock(clock)
        .config(config)
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();
    resolver
}

#[tokio::test]
async fn test_static_source_serves_after_clear() {
    let document = MetadataDocument::Entities(EntitiesDescriptor::new(vec![
        idp("https://id1.example.org"),
        sp("https://id2.example.org"),
    ]));
    let source = Arc::new(StaticDocumentSource::new("static", vec![document]));
    let resolver = MetadataResolver::builder("static", source).build().unwrap();
    resolver.initialize().await.unwrap();

    let found = resolver.resolve(&by_id("https://id1.example.org")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "https://id1.example.org");
    assert_eq!(resolver.store().len(), 2);

    resolver.clear().await.unwrap();
    assert!(resolver.store().is_empty());

    // The snapshot still answers, so both entities come back on demand
    let found = resolver.resolve(&by_id("https://id2.example.org")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "https://id2.example.org");
    assert!(resolver
        .resolve_single(&by_id("https://id1.example.org"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_cached_entity_is_fetched_once() {
    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = dynamic_resolver(origin.clone(), clock, ResolverConfig::default()).await;

    for _ in 0..3 {
        let found = resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
        assert_eq!(found.len(), 1);
    }
    assert_eq!(origin.fetches(), 1);

    // Clearing one entity forces the next resolve back to the origin
    resolver.clear_entity("https://idp.example.org").await.unwrap();
    assert!(!resolver.store().contains("https://idp.example.org"));
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_fetch() {
    let origin = ScriptedOrigin::slow(vec![idp("https://idp.example.org")], 50);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = dynamic_resolver(origin.clone(), clock, ResolverConfig::default()).await;

    let criteria = by_id("https://idp.example.org");
    let (a, b, c) = tokio::join!(
        resolver.resolve(&criteria),
        resolver.resolve(&criteria),
        resolver.resolve(&criteria)
    );
    assert_eq!(a.unwrap().len(), 1);
    assert_eq!(b.unwrap().len(), 1);
    assert_eq!(c.unwrap().len(), 1);
    assert_eq!(origin.fetches(), 1);
}

#[tokio::test]
async fn test_expired_entry_is_refetched() {
    let origin = ScriptedOrigin::with(vec![
        idp("https://idp.example.org").with_cache_duration(Duration::minutes(30))
    ]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = dynamic_resolver(origin.clone(), clock.clone(), ResolverConfig::default()).await;

    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    clock.advance(Duration::minutes(29));
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(origin.fetches(), 1);

    clock.advance(Duration::minutes(2));
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test]
async fn test_secondary_index_lookup_and_eviction() {
    let origin = ScriptedOrigin::with(vec![
        idp("https://idp.example.org"),
        sp("https://sp.example.org"),
    ]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = dynamic_resolver(origin.clone(), clock, ResolverConfig::default()).await;

    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    resolver.resolve(&by_id("https://sp.example.org")).await.unwrap();

    // Role index
    let idps = CriteriaSet::new().with(Criterion::role(RoleType::IdpSso));
    let found = resolver.resolve(&idps).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "https://idp.example.org");

    // Artifact SourceID index
    let mut artifact = vec![0x00, 0x04, 0x00, 0x00];
    artifact.extend(hex::decode(entity_id_source_id("https://sp.example.org")).unwrap());
    artifact.extend([0u8; 20]);
    let by_artifact = CriteriaSet::new().with(Criterion::artifact(artifact).unwrap());
    assert_eq!(
        resolver.lookup_indexed_items(&by_artifact).unwrap(),
        ["https://sp.example.org".to_string()].into_iter().collect()
    );
    let found = resolver.resolve(&by_artifact).await.unwrap();
    assert_eq!(found[0].entity_id, "https://sp.example.org");
    assert_eq!(origin.fetches(), 2);

    // Evicting the entity removes it from every index
    resolver.clear_entity("https://idp.example.org").await.unwrap();
    assert!(resolver.lookup_indexed_items(&idps).unwrap().is_empty());
    assert!(resolver.resolve(&idps).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_role_criterion_filters_results() {
    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = dynamic_resolver(origin, clock, ResolverConfig::default()).await;

    let as_sp = by_id("https://idp.example.org").with(Criterion::role(RoleType::SpSso));
    assert!(resolver.resolve(&as_sp).await.unwrap().is_empty());

    let as_idp = by_id("https://idp.example.org").with(Criterion::role(RoleType::IdpSso));
    assert_eq!(resolver.resolve(&as_idp).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_negative_lookup_cache() {
    let origin = ScriptedOrigin::with(Vec::new());
    let clock = Arc::new(ManualClock::starting_now());
    let config = ResolverConfig {
        negative_lookup_cache_duration: Some(Duration::minutes(5)),
        ..Default::default()
    };
    let resolver = dynamic_resolver(origin.clone(), clock.clone(), config).await;

    assert!(resolver.resolve(&by_id("https://new.example.org")).await.unwrap().is_empty());
    assert!(resolver.resolve(&by_id("https://new.example.org")).await.unwrap().is_empty());
    assert_eq!(origin.fetches(), 1);

    // The entity appears, but the marker still suppresses fetches until it lapses
    origin.set(vec![idp("https://new.example.org")]);
    assert!(resolver.resolve(&by_id("https://new.example.org")).await.unwrap().is_empty());
    clock.advance(Duration::minutes(6));
    assert_eq!(
        resolver.resolve(&by_id("https://new.example.org")).await.unwrap().len(),
        1
    );
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test]
async fn test_refetch_failure_serves_stale_copy() {
    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let config = ResolverConfig {
        refresh_failure_policy: RefreshFailurePolicy::RetainAndExtend(Duration::minutes(10)),
        max_idle: None,
        ..Default::default()
    };
    let resolver = dynamic_resolver(origin.clone(), clock.clone(), config).await;
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();

    clock.advance(Duration::hours(9));
    origin.fail(true);
    let found = resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(origin.fetches(), 2);

    // Extended, so no new fetch within the retry interval
    clock.advance(Duration::minutes(5));
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test]
async fn test_refetch_failure_with_evict_policy() {
    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let config = ResolverConfig {
        refresh_failure_policy: RefreshFailurePolicy::Evict,
        ..Default::default()
    };
    let resolver = dynamic_resolver(origin.clone(), clock.clone(), config).await;
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();

    clock.advance(Duration::hours(9));
    origin.fail(true);
    let err = resolver
        .resolve(&by_id("https://idp.example.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::ResolutionFailed { .. }));
    assert!(!resolver.store().contains("https://idp.example.org"));
}

#[tokio::test]
async fn test_cleanup_evicts_expired_records() {
    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = dynamic_resolver(origin, clock.clone(), ResolverConfig::default()).await;
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();

    assert_eq!(resolver.cleanup(), 0);
    clock.advance(Duration::hours(9));
    assert_eq!(resolver.cleanup(), 1);
    assert!(resolver.store().is_empty());
}

#[tokio::test]
async fn test_persistent_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager: Arc<dyn PersistentCacheManager<EntityDescriptor>> =
        Arc::new(FilesystemCacheManager::new(dir.path()).await.unwrap());

    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let first = MetadataResolver::builder("first", origin.clone())
        .persistence(Persistence::new(Arc::clone(&manager)))
        .build()
        .unwrap();
    first.initialize().await.unwrap();
    first.resolve(&by_id("https://idp.example.org")).await.unwrap();

    let key = sha256_entity_id_key(&EntityDescriptor::new("https://idp.example.org"));
    assert!(manager.exists(&key).await.unwrap());
    first.destroy();

    // A fresh resolver warms from disk and never touches the origin
    let empty_origin = ScriptedOrigin::with(Vec::new());
    let second = MetadataResolver::builder("second", empty_origin.clone())
        .persistence(Persistence::new(Arc::clone(&manager)))
        .build()
        .unwrap();
    second.initialize().await.unwrap();

    let found = second.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(empty_origin.fetches(), 0);

    // clear() removes persisted copies too
    second.clear().await.unwrap();
    assert!(manager.list_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_warm_start_repairs_cache_directory() {
    let dir = tempfile::tempdir().unwrap();
    let manager: Arc<dyn PersistentCacheManager<EntityDescriptor>> =
        Arc::new(FilesystemCacheManager::new(dir.path()).await.unwrap());

    let stale = idp("https://stale-key.example.org");
    manager.save("legacy-key", &stale, false).await.unwrap();

    let expired = idp("https://expired.example.org")
        .with_valid_until(chrono::Utc::now() - Duration::hours(1));
    let expired_key = sha256_entity_id_key(&expired);
    manager.save(&expired_key, &expired, false).await.unwrap();

    tokio::fs::write(dir.path().join("corrupt-entry"), b"{ not json")
        .await
        .unwrap();

    let origin = ScriptedOrigin::with(Vec::new());
    let resolver = MetadataResolver::builder("warm", origin.clone())
        .persistence(Persistence::new(Arc::clone(&manager)))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();

    let keys = manager.list_keys().await.unwrap();
    assert!(keys.contains(&sha256_entity_id_key(&stale)));
    assert!(!keys.contains("legacy-key"));
    assert!(!keys.contains(&expired_key));
    // Unreadable entries are skipped, not deleted
    assert!(keys.contains("corrupt-entry"));

    assert!(resolver.store().contains("https://stale-key.example.org"));
    assert!(!resolver.store().contains("https://expired.example.org"));
    assert_eq!(origin.fetches(), 0);
}

#[tokio::test]
async fn test_entity_gone_at_origin_is_unpersisted() {
    let dir = tempfile::tempdir().unwrap();
    let manager: Arc<dyn PersistentCacheManager<EntityDescriptor>> =
        Arc::new(FilesystemCacheManager::new(dir.path()).await.unwrap());

    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = MetadataResolver::builder("gone", origin.clone())
        .clock(clock.clone())
        .persistence(Persistence::new(Arc::clone(&manager)))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(manager.list_keys().await.unwrap().len(), 1);

    origin.set(Vec::new());
    clock.advance(Duration::hours(9));
    assert!(resolver
        .resolve(&by_id("https://idp.example.org"))
        .await
        .unwrap()
        .is_empty());
    assert!(manager.list_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_copy_served_while_refetch_in_flight() {
    let origin = ScriptedOrigin::slow(vec![idp("https://idp.example.org")], 400);
    let clock = Arc::new(ManualClock::starting_now());
    let config = ResolverConfig {
        min_cache_duration: Duration::minutes(1),
        max_cache_duration: Duration::minutes(1),
        max_idle: None,
        ..Default::default()
    };
    let resolver = dynamic_resolver(origin.clone(), clock.clone(), config).await;
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();

    clock.advance(Duration::minutes(2));
    let refetch = {
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move { resolver.resolve(&by_id("https://idp.example.org")).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let reader = tokio::time::timeout(
        StdDuration::from_millis(150),
        resolver.resolve(&by_id("https://idp.example.org")),
    )
    .await
    .expect("reader waited on the refetch");
    assert_eq!(reader.unwrap().len(), 1);

    assert_eq!(refetch.await.unwrap().unwrap().len(), 1);
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test]
async fn test_filter_rejection_fails_resolution() {
    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let require_valid_until: Arc<dyn MetadataFilter> = Arc::new(RequiredValidUntilFilter::new(None));
    let resolver = MetadataResolver::builder("filtered", origin.clone())
        .filters(FilterChain::new(vec![require_valid_until]))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();

    let err = resolver
        .resolve(&by_id("https://idp.example.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::ResolutionFailed { .. }));
    assert!(resolver.store().is_empty());
    assert_eq!(origin.fetches(), 1);
}

#[tokio::test]
async fn test_evict_policy_also_unpersists() {
    let dir = tempfile::tempdir().unwrap();
    let manager: Arc<dyn PersistentCacheManager<EntityDescriptor>> =
        Arc::new(FilesystemCacheManager::new(dir.path()).await.unwrap());

    let origin = ScriptedOrigin::with(vec![idp("https://idp.example.org")]);
    let clock = Arc::new(ManualClock::starting_now());
    let resolver = MetadataResolver::builder("evicting", origin.clone())
        .clock(clock.clone())
        .config(ResolverConfig {
            refresh_failure_policy: RefreshFailurePolicy::Evict,
            ..Default::default()
        })
        .persistence(Persistence::new(Arc::clone(&manager)))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();
    resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(manager.list_keys().await.unwrap().len(), 1);

    clock.advance(Duration::hours(9));
    origin.fail(true);
    assert!(resolver
        .resolve(&by_id("https://idp.example.org"))
        .await
        .is_err());
    assert!(manager.list_keys().await.unwrap().is_empty());
}

/// Filesystem cache whose loads take a while, counting the ones that finish
struct SlowCache {
    inner: FilesystemCacheManager<EntityDescriptor>,
    delay: StdDuration,
    loads_finished: AtomicUsize,
}

#[async_trait]
impl PersistentCacheManager<EntityDescriptor> for SlowCache {
    async fn list_keys(&self) -> MetadataResult<HashSet<String>> {
        self.inner.list_keys().await
    }

    async fn exists(&self, key: &str) -> MetadataResult<bool> {
        self.inner.exists(key).await
    }

    async fn load(&self, key: &str) -> MetadataResult<Option<EntityDescriptor>> {
        tokio::time::sleep(self.delay).await;
        let loaded = self.inner.load(key).await;
        self.loads_finished.fetch_add(1, Ordering::SeqCst);
        loaded
    }

    async fn save(&self, key: &str, value: &EntityDescriptor, overwrite: bool) -> MetadataResult<()> {
        self.inner.save(key, value, overwrite).await
    }

    async fn remove(&self, key: &str) -> MetadataResult<bool> {
        self.inner.remove(key).await
    }

    async fn rename_key(&self, old_key: &str, new_key: &str) -> MetadataResult<bool> {
        self.inner.rename_key(old_key, new_key).await
    }
}

async fn slow_cache_with(dir: &std::path::Path, descriptor: &EntityDescriptor) -> Arc<SlowCache> {
    let inner = FilesystemCacheManager::new(dir).await.unwrap();
    inner
        .save(&sha256_entity_id_key(descriptor), descriptor, false)
        .await
        .unwrap();
    Arc::new(SlowCache {
        inner,
        delay: StdDuration::from_millis(300),
        loads_finished: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn test_background_warm_up_loads_after_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let cache = slow_cache_with(dir.path(), &idp("https://idp.example.org")).await;

    let origin = ScriptedOrigin::with(Vec::new());
    let resolver = MetadataResolver::builder("background", origin.clone())
        .persistence(Persistence::new(cache.clone()).background_init(true))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();

    // initialize() did not wait for the load
    assert!(resolver.is_initialized());
    assert_eq!(cache.loads_finished.load(Ordering::SeqCst), 0);
    assert!(!resolver.store().contains("https://idp.example.org"));

    for _ in 0..100 {
        if resolver.store().contains("https://idp.example.org") {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    let found = resolver.resolve(&by_id("https://idp.example.org")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(origin.fetches(), 0);
}

#[tokio::test]
async fn test_destroy_aborts_background_warm_up() {
    let dir = tempfile::tempdir().unwrap();
    let cache = slow_cache_with(dir.path(), &idp("https://idp.example.org")).await;

    let resolver = MetadataResolver::builder("aborted", ScriptedOrigin::with(Vec::new()))
        .persistence(Persistence::new(cache.clone()).background_init(true))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();
    resolver.destroy();

    tokio::time::sleep(StdDuration::from_millis(500)).await;
    assert_eq!(cache.loads_finished.load(Ordering::SeqCst), 0);
    assert!(resolver.store().is_empty());
}
