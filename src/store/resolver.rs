/// Caching metadata resolver
///
/// One resolver type covers static, full-pull and per-query sources; the
/// difference lives in the injected `OriginFetcher`.
///
/// Resolution order for an entity ID:
/// 1. Serve unexpired records from the backing store
/// 2. Honour a negative lookup marker from a recent not-found
/// 3. Fetch from the origin (outside any store lock), filter, cache, index
///    and write through to the persistent cache
use super::{
    backing::{BackingStore, CacheRecord},
    persistent::{default_key_generator, CacheKeyGenerator, DescriptorCache},
};
use crate::{
    clock::{self, Clock},
    criteria::{CriteriaSet, Criterion},
    error::{MetadataError, MetadataResult},
    fetch::{OriginFetcher, RefreshOutcome},
    filter::{FilterChain, FilterContext},
    index::{default_indexes, MetadataIndex},
    metadata::{EntityDescriptor, MetadataDocument},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const UNINITIALIZED: u8 = 0;
const INITIALIZED: u8 = 1;
const DESTROYED: u8 = 2;

/// What to do when refetching an expired entry fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailurePolicy {
    /// Keep serving the stale record, retrying after the interval
    RetainAndExtend(Duration),
    /// Drop the stale record and report the failure
    Evict,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Lower bound applied to a descriptor's cacheDuration
    pub min_cache_duration: Duration,
    /// Upper bound, also used when a descriptor states no cacheDuration
    pub max_cache_duration: Duration,
    /// How long a not-found answer suppresses further origin fetches
    pub negative_lookup_cache_duration: Option<Duration>,
    pub refresh_failure_policy: RefreshFailurePolicy,
    /// Evict records not accessed for this long
    pub max_idle: Option<Duration>,
    /// Allow only one origin fetch per entity ID at a time
    pub single_flight: bool,
    /// Fetch directly from non-entityID criteria on an index miss
    pub secondary_lookup: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_cache_duration: Duration::minutes(10),
            max_cache_duration: Duration::hours(8),
            negative_lookup_cache_duration: Some(Duration::minutes(10)),
            refresh_failure_policy: RefreshFailurePolicy::RetainAndExtend(Duration::minutes(10)),
            max_idle: Some(Duration::hours(8)),
            single_flight: true,
            secondary_lookup: true,
        }
    }
}

/// Persistent cache wiring
#[derive(Clone)]
pub struct Persistence {
    pub manager: DescriptorCache,
    pub key_generator: CacheKeyGenerator,
    /// Warm the backing store from the cache during initialize
    pub init_from_cache: bool,
    /// Warm up in a background task instead of blocking initialize
    pub background_init: bool,
}

impl Persistence {
    pub fn new(manager: DescriptorCache) -> Self {
        Self {
            manager,
            key_generator: default_key_generator(),
            init_from_cache: true,
            background_init: false,
        }
    }

    pub fn with_key_generator(mut self, key_generator: CacheKeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn init_from_cache(mut self, enabled: bool) -> Self {
        self.init_from_cache = enabled;
        self
    }

    pub fn background_init(mut self, enabled: bool) -> Self {
        self.background_init = enabled;
        self
    }
}

/// Full-pull refresh bookkeeping
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStatus {
    /// Last refresh attempt, successful or not
    pub last_refresh: Option<DateTime<Utc>>,
    /// Last refresh that loaded new data
    pub last_update: Option<DateTime<Utc>>,
    pub next_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct ResolverBuilder {
    id: String,
    fetcher: Arc<dyn OriginFetcher>,
    filters: FilterChain,
    warm_start_filters: Option<FilterChain>,
    indexes: Option<Vec<Arc<dyn MetadataIndex>>>,
    clock: Option<Arc<dyn Clock>>,
    config: ResolverConfig,
    persistence: Option<Persistence>,
}

impl ResolverBuilder {
    pub fn filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    /// Chain re-run over persisted entries at warm start (defaults to `filters`)
    pub fn warm_start_filters(mut self, filters: FilterChain) -> Self {
        self.warm_start_filters = Some(filters);
        self
    }

    pub fn indexes(mut self, indexes: Vec<Arc<dyn MetadataIndex>>) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> MetadataResult<Arc<MetadataResolver>> {
        if self.id.trim().is_empty() {
            return Err(MetadataError::Configuration(
                "resolver ID cannot be empty".to_string(),
            ));
        }
        if self.config.min_cache_duration < Duration::zero() {
            return Err(MetadataError::Configuration(
                "minimum cache duration cannot be negative".to_string(),
            ));
        }
        if self.config.min_cache_duration > self.config.max_cache_duration {
            return Err(MetadataError::Configuration(format!(
                "{}: minimum cache duration exceeds maximum cache duration",
                self.id
            )));
        }

        let warm_start_filters = self
            .warm_start_filters
            .unwrap_or_else(|| self.filters.clone());

        Ok(Arc::new(MetadataResolver {
            store: BackingStore::new(self.indexes.unwrap_or_else(default_indexes)),
            clock: self.clock.unwrap_or_else(clock::system),
            id: self.id,
            config: self.config,
            fetcher: self.fetcher,
            filters: self.filters,
            warm_start_filters,
            persistence: self.persistence,
            state: AtomicU8::new(UNINITIALIZED),
            in_flight: DashMap::new(),
            negative: DashMap::new(),
            status: RwLock::new(RefreshStatus::default()),
            warm_up: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }
}

/// Resolves entity descriptors by criteria, caching the results
pub struct MetadataResolver {
    id: String,
    config: ResolverConfig,
    fetcher: Arc<dyn OriginFetcher>,
    filters: FilterChain,
    warm_start_filters: FilterChain,
    store: BackingStore,
    clock: Arc<dyn Clock>,
    persistence: Option<Persistence>,
    state: AtomicU8,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    /// entityID -> instant until which not-found answers are reused
    negative: DashMap<String, DateTime<Utc>>,
    status: RwLock<RefreshStatus>,
    warm_up: StdMutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MetadataResolver {
    pub fn builder(id: impl Into<String>, fetcher: Arc<dyn OriginFetcher>) -> ResolverBuilder {
        ResolverBuilder {
            id: id.into(),
            fetcher,
            filters: FilterChain::default(),
            warm_start_filters: None,
            indexes: None,
            clock: None,
            config: ResolverConfig::default(),
            persistence: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::SeqCst) == INITIALIZED
    }

    /// Cancelled when the resolver is destroyed
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn refresh_status(&self) -> RefreshStatus {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Time until the next scheduled full-pull refresh
    pub fn next_refresh_delay(&self) -> Option<StdDuration> {
        let next = self.refresh_status().next_refresh?;
        Some((next - self.clock.now()).to_std().unwrap_or(StdDuration::ZERO))
    }

    /// Delay before retrying a failed refresh, for sources that refresh
    pub fn retry_delay(&self) -> Option<StdDuration> {
        self.fetcher.retry_delay()
    }

    fn ensure_initialized(&self) -> MetadataResult<()> {
        match self.state.load(Ordering::SeqCst) {
            INITIALIZED => Ok(()),
            DESTROYED => Err(MetadataError::NotInitialized(format!(
                "resolver {} has been destroyed",
                self.id
            ))),
            _ => Err(MetadataError::NotInitialized(format!(
                "resolver {} is not initialized",
                self.id
            ))),
        }
    }

    fn update_status(&self, update: impl FnOnce(&mut RefreshStatus)) {
        match self.status.write() {
            Ok(mut status) => update(&mut status),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    fn update_size_gauge(&self) {
        metrics::set_backing_store_size(&self.id, self.store.len());
    }

    /// Warm the cache and load snapshot sources
    ///
    /// Calling this again on an initialized resolver is a no-op.
    pub async fn initialize(self: &Arc<Self>) -> MetadataResult<()> {
        match self.state.load(Ordering::SeqCst) {
            INITIALIZED => return Ok(()),
            DESTROYED => return self.ensure_initialized(),
            _ => {}
        }

        if let Some(persistence) = &self.persistence {
            if persistence.init_from_cache {
                if persistence.background_init {
                    let resolver = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        resolver.load_persistent_cache().await;
                    });
                    if let Ok(mut warm_up) = self.warm_up.lock() {
                        *warm_up = Some(handle);
                    }
                } else {
                    self.load_persistent_cache().await;
                }
            }
        }

        if let Err(e) = self.run_refresh().await {
            warn!("{}: initial refresh failed: {}", self.id, e);
        }

        self.state.store(INITIALIZED, Ordering::SeqCst);
        info!("Metadata resolver {} initialized", self.id);
        Ok(())
    }

    /// Stop background work and release the backing store
    pub fn destroy(&self) {
        if self.state.swap(DESTROYED, Ordering::SeqCst) == DESTROYED {
            return;
        }
        self.shutdown.cancel();
        if let Ok(mut warm_up) = self.warm_up.lock() {
            if let Some(handle) = warm_up.take() {
                handle.abort();
            }
        }
        self.store.clear();
        self.negative.clear();
        self.in_flight.clear();
        self.update_size_gauge();
        info!("Metadata resolver {} destroyed", self.id);
    }

    /// Reload a snapshot source, returning the delay until the next refresh
    pub async fn refresh(&self) -> MetadataResult<Option<StdDuration>> {
        self.ensure_initialized()?;
        self.run_refresh().await
    }

    async fn run_refresh(&self) -> MetadataResult<Option<StdDuration>> {
        let now = self.clock.now();
        let context = FilterContext::new(self.id.clone(), now);
        let result = self.fetcher.refresh(&self.filters, &context).await;

        let next_at = |delay: Option<StdDuration>| {
            delay
                .and_then(|d| Duration::from_std(d).ok())
                .map(|d| now + d)
        };

        match result {
            Ok(RefreshOutcome::NotApplicable) => Ok(None),
            Ok(RefreshOutcome::Updated {
                descriptors,
                next_refresh,
            }) => {
                let count = self.replace_all(descriptors, now);
                self.update_status(|status| {
                    status.last_refresh = Some(now);
                    status.last_update = Some(now);
                    status.next_refresh = next_at(next_refresh);
                    status.last_error = None;
                });
                metrics::record_refresh_timestamp(&self.id, "refresh", now.timestamp());
                metrics::record_refresh_timestamp(&self.id, "update", now.timestamp());
                info!("{}: refreshed, {} entities cached", self.id, count);
                Ok(next_refresh)
            }
            Ok(RefreshOutcome::Unchanged { next_refresh }) => {
                self.update_status(|status| {
                    status.last_refresh = Some(now);
                    status.next_refresh = next_at(next_refresh);
                    status.last_error = None;
                });
                metrics::record_refresh_timestamp(&self.id, "refresh", now.timestamp());
                debug!("{}: refresh found no changes", self.id);
                Ok(next_refresh)
            }
            Err(e) => {
                let retry = self.fetcher.retry_delay();
                self.update_status(|status| {
                    status.last_refresh = Some(now);
                    status.next_refresh = next_at(retry);
                    status.last_error = Some(e.to_string());
                });
                metrics::record_refresh_timestamp(&self.id, "refresh", now.timestamp());
                metrics::record_error("refresh_failed", "resolver");
                Err(e)
            }
        }
    }

    /// Swap the backing store contents for a freshly loaded snapshot
    fn replace_all(&self, descriptors: Vec<EntityDescriptor>, now: DateTime<Utc>) -> usize {
        let mut grouped: HashMap<String, Vec<EntityDescriptor>> = HashMap::new();
        for descriptor in descriptors {
            grouped
                .entry(descriptor.entity_id.clone())
                .or_default()
                .push(descriptor);
        }

        self.store.clear();
        self.negative.clear();
        for (entity_id, descriptors) in grouped {
            self.insert_records(&entity_id, descriptors, now);
        }
        self.update_size_gauge();
        self.store.len()
    }

    /// Resolve every descriptor matching the criteria
    ///
    /// Absence is an empty result; fetch and filter failures surface as
    /// `ResolutionFailed`.
    pub async fn resolve(&self, criteria: &CriteriaSet) -> MetadataResult<Vec<Arc<EntityDescriptor>>> {
        self.ensure_initialized()?;

        let result = match criteria.entity_id() {
            Some(entity_id) => self.resolve_entity_id(entity_id, criteria).await,
            None => self.resolve_secondary(criteria).await,
        };

        match result {
            Ok(descriptors) => {
                let descriptors = apply_predicates(descriptors, criteria);
                let outcome = if descriptors.is_empty() { "not_found" } else { "found" };
                metrics::record_resolution(&self.id, outcome);
                Ok(descriptors)
            }
            Err(e) => {
                metrics::record_resolution(&self.id, "failed");
                Err(e)
            }
        }
    }

    /// First match, if any
    pub async fn resolve_single(
        &self,
        criteria: &CriteriaSet,
    ) -> MetadataResult<Option<Arc<EntityDescriptor>>> {
        Ok(self.resolve(criteria).await?.into_iter().next())
    }

    /// Entity IDs the secondary indexes hold for the criteria
    pub fn lookup_indexed_items(&self, criteria: &CriteriaSet) -> MetadataResult<HashSet<String>> {
        self.ensure_initialized()?;
        Ok(self.store.lookup_indexed(criteria).unwrap_or_default())
    }

    async fn resolve_secondary(
        &self,
        criteria: &CriteriaSet,
    ) -> MetadataResult<Vec<Arc<EntityDescriptor>>> {
        if let Some(ids) = self.store.lookup_indexed(criteria) {
            if !ids.is_empty() {
                let mut ids: Vec<String> = ids.into_iter().collect();
                ids.sort();

                let mut resolved = Vec::new();
                for entity_id in ids {
                    let mut scoped = criteria.clone();
                    scoped.add(Criterion::EntityId(entity_id.clone()));
                    resolved.extend(self.resolve_entity_id(&entity_id, &scoped).await?);
                }
                return Ok(resolved);
            }
        }

        if !(self.config.secondary_lookup && self.fetcher.supports_secondary_lookup()) {
            debug!("{}: no index hit for {}", self.id, criteria);
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let Some(descriptors) = self.fetch_and_filter(criteria, now).await? else {
            return Ok(Vec::new());
        };

        let mut grouped: HashMap<String, Vec<EntityDescriptor>> = HashMap::new();
        for descriptor in descriptors {
            grouped
                .entry(descriptor.entity_id.clone())
                .or_default()
                .push(descriptor);
        }

        let mut resolved = Vec::new();
        for (entity_id, descriptors) in grouped {
            let stored = self.insert_records(&entity_id, descriptors, now);
            self.persist(&stored).await;
            resolved.extend(stored);
        }
        self.update_size_gauge();
        Ok(resolved)
    }

    async fn resolve_entity_id(
        &self,
        entity_id: &str,
        criteria: &CriteriaSet,
    ) -> MetadataResult<Vec<Arc<EntityDescriptor>>> {
        let now = self.clock.now();
        if let Some(live) = self.live_descriptors(entity_id, now) {
            metrics::record_cache_access(&self.id, true);
            return Ok(live);
        }
        metrics::record_cache_access(&self.id, false);

        if self.negative_cached(entity_id, now) {
            debug!("{}: {} recently not found", self.id, entity_id);
            return Ok(Vec::new());
        }

        if !self.config.single_flight {
            return self.fetch_entity(entity_id, criteria).await;
        }

        let lock = Arc::clone(&self.in_flight.entry(entity_id.to_string()).or_default());
        let result = match lock.try_lock() {
            Ok(_guard) => self.fetch_unless_cached(entity_id, criteria).await,
            // A refetch is in flight: readers of an expired entry keep the stale copy
            Err(_) => match self.stale_descriptors(entity_id, now) {
                Some(stale) => {
                    debug!("{}: serving stale {} during refetch", self.id, entity_id);
                    Ok(stale)
                }
                None => {
                    let _guard = lock.lock().await;
                    self.fetch_unless_cached(entity_id, criteria).await
                }
            },
        };
        drop(lock);
        self.in_flight
            .remove_if(entity_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Fetch while holding the entity's in-flight lock
    async fn fetch_unless_cached(
        &self,
        entity_id: &str,
        criteria: &CriteriaSet,
    ) -> MetadataResult<Vec<Arc<EntityDescriptor>>> {
        // Another caller may have completed the fetch while we waited
        let now = self.clock.now();
        if let Some(live) = self.live_descriptors(entity_id, now) {
            Ok(live)
        } else if self.negative_cached(entity_id, now) {
            Ok(Vec::new())
        } else {
            self.fetch_entity(entity_id, criteria).await
        }
    }

    fn stale_descriptors(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Vec<Arc<EntityDescriptor>>> {
        let records = self.store.get(entity_id, now)?;
        let stale: Vec<Arc<EntityDescriptor>> =
            records.iter().map(|r| Arc::clone(&r.descriptor)).collect();
        (!stale.is_empty()).then_some(stale)
    }

    fn live_descriptors(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Vec<Arc<EntityDescriptor>>> {
        let records = self.store.get(entity_id, now)?;
        let live: Vec<Arc<EntityDescriptor>> = records
            .iter()
            .filter(|r| !r.is_expired(now))
            .map(|r| Arc::clone(&r.descriptor))
            .collect();
        (!live.is_empty()).then_some(live)
    }

    fn negative_cached(&self, entity_id: &str, now: DateTime<Utc>) -> bool {
        self.negative
            .get(entity_id)
            .map_or(false, |until| *until > now)
    }

    async fn fetch_entity(
        &self,
        entity_id: &str,
        criteria: &CriteriaSet,
    ) -> MetadataResult<Vec<Arc<EntityDescriptor>>> {
        let now = self.clock.now();
        let stale = self.store.get(entity_id, now);

        match self.fetch_and_filter(criteria, now).await {
            Ok(Some(descriptors)) => {
                let matching: Vec<EntityDescriptor> = descriptors
                    .into_iter()
                    .filter(|d| d.entity_id == entity_id)
                    .collect();
                if matching.is_empty() {
                    return self.handle_not_found(entity_id, stale, now).await;
                }
                let stored = self.insert_records(entity_id, matching, now);
                self.persist(&stored).await;
                self.update_size_gauge();
                Ok(stored)
            }
            Ok(None) => self.handle_not_found(entity_id, stale, now).await,
            Err(e) => match (stale, self.config.refresh_failure_policy) {
                (Some(records), RefreshFailurePolicy::RetainAndExtend(interval)) => {
                    warn!(
                        "{}: refetch of {} failed, serving cached metadata: {}",
                        self.id, entity_id, e
                    );
                    self.store.extend_expiration(entity_id, now + interval);
                    Ok(records.into_iter().map(|r| r.descriptor).collect())
                }
                (Some(records), RefreshFailurePolicy::Evict) => {
                    warn!("{}: refetch of {} failed, evicting: {}", self.id, entity_id, e);
                    self.store.remove(entity_id);
                    self.update_size_gauge();
                    self.unpersist(entity_id, &records).await;
                    Err(e)
                }
                (None, _) => Err(e),
            },
        }
    }

    async fn handle_not_found(
        &self,
        entity_id: &str,
        stale: Option<Vec<CacheRecord>>,
        now: DateTime<Utc>,
    ) -> MetadataResult<Vec<Arc<EntityDescriptor>>> {
        if let Some(records) = stale {
            info!("{}: {} no longer exists at the origin", self.id, entity_id);
            self.store.remove(entity_id);
            self.update_size_gauge();
            self.unpersist(entity_id, &records).await;
        }
        if let Some(duration) = self.config.negative_lookup_cache_duration {
            self.negative.insert(entity_id.to_string(), now + duration);
        }
        debug!("{}: {} not found", self.id, entity_id);
        Ok(Vec::new())
    }

    /// Fetch and run the filter chain, flattening the result
    async fn fetch_and_filter(
        &self,
        criteria: &CriteriaSet,
        now: DateTime<Utc>,
    ) -> MetadataResult<Option<Vec<EntityDescriptor>>> {
        let document = self
            .fetcher
            .fetch(criteria)
            .await
            .map_err(|e| MetadataError::resolution_failed(criteria, e))?;
        let Some(document) = document else {
            return Ok(None);
        };

        let document = if self.fetcher.prefiltered() {
            Some(document)
        } else {
            let context = FilterContext::new(self.id.clone(), now);
            self.filters
                .apply(document, &context)
                .map_err(|e| MetadataError::resolution_failed(criteria, e))?
        };

        Ok(document.map(MetadataDocument::into_descriptors))
    }

    /// Lifetime of a freshly fetched descriptor, `None` if it is already invalid
    ///
    /// `now + clamp(cacheDuration, min, max)`, never beyond validUntil.
    pub fn expiration_for(
        &self,
        descriptor: &EntityDescriptor,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !descriptor.is_valid_at(now) {
            return None;
        }
        let requested = descriptor
            .cache_duration()
            .unwrap_or(self.config.max_cache_duration);
        let lifetime = requested.clamp(
            self.config.min_cache_duration,
            self.config.max_cache_duration,
        );
        let expiration = now + lifetime;
        Some(match descriptor.valid_until {
            Some(until) => expiration.min(until),
            None => expiration,
        })
    }

    /// Cache descriptors under `entity_id`, dropping their wire form
    fn insert_records(
        &self,
        entity_id: &str,
        descriptors: Vec<EntityDescriptor>,
        now: DateTime<Utc>,
    ) -> Vec<Arc<EntityDescriptor>> {
        let records: Vec<CacheRecord> = descriptors
            .into_iter()
            .filter_map(|descriptor| {
                let expiration = self.expiration_for(&descriptor, now)?;
                Some(CacheRecord::new(descriptor.without_serialized(), expiration, now))
            })
            .collect();

        if records.is_empty() {
            debug!("{}: not caching {}, validity has passed", self.id, entity_id);
            return Vec::new();
        }

        let stored = records.iter().map(|r| Arc::clone(&r.descriptor)).collect();
        self.store.insert(entity_id, records);
        self.negative.remove(entity_id);
        stored
    }

    /// Write-through; failures are logged, the cached copy still serves
    async fn persist(&self, descriptors: &[Arc<EntityDescriptor>]) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        for descriptor in descriptors {
            let key = (persistence.key_generator)(descriptor.as_ref());
            if let Err(e) = persistence.manager.save(&key, descriptor.as_ref(), true).await {
                warn!(
                    "{}: failed to persist {}: {}",
                    self.id, descriptor.entity_id, e
                );
                metrics::record_error("persist_failed", "resolver");
            }
        }
    }

    async fn unpersist(&self, entity_id: &str, records: &[CacheRecord]) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let mut keys: HashSet<String> = records
            .iter()
            .map(|r| (persistence.key_generator)(r.descriptor.as_ref()))
            .collect();
        if keys.is_empty() {
            keys.insert((persistence.key_generator)(&EntityDescriptor::new(entity_id)));
        }
        for key in keys {
            if let Err(e) = persistence.manager.remove(&key).await {
                warn!("{}: failed to remove persisted {}: {}", self.id, entity_id, e);
            }
        }
    }

    /// Drop every cached entity, including persisted copies
    pub async fn clear(&self) -> MetadataResult<()> {
        self.ensure_initialized()?;
        self.store.clear();
        self.negative.clear();
        self.update_size_gauge();

        if let Some(persistence) = &self.persistence {
            for key in persistence.manager.list_keys().await? {
                persistence.manager.remove(&key).await?;
            }
        }
        info!("{}: cache cleared", self.id);
        Ok(())
    }

    /// Drop one entity so the next resolve fetches it again
    pub async fn clear_entity(&self, entity_id: &str) -> MetadataResult<()> {
        self.ensure_initialized()?;
        let removed = self.store.remove(entity_id);
        self.negative.remove(entity_id);
        self.update_size_gauge();

        if let Some(persistence) = &self.persistence {
            let mut keys: HashSet<String> = removed
                .iter()
                .flatten()
                .map(|r| (persistence.key_generator)(r.descriptor.as_ref()))
                .collect();
            if keys.is_empty() {
                keys.insert((persistence.key_generator)(&EntityDescriptor::new(entity_id)));
            }
            for key in keys {
                persistence.manager.remove(&key).await?;
            }
        }
        debug!("{}: cleared {}", self.id, entity_id);
        Ok(())
    }

    /// Evict expired and idle records and stale negative markers
    pub fn cleanup(&self) -> usize {
        if self.state.load(Ordering::SeqCst) == DESTROYED {
            return 0;
        }
        let now = self.clock.now();
        let evicted = self.store.cleanup(now, self.config.max_idle);
        self.negative.retain(|_, until| *until > now);
        self.update_size_gauge();
        if evicted > 0 {
            debug!("{}: evicted {} expired record(s)", self.id, evicted);
        }
        evicted
    }

    /// Warm the backing store from the persistent cache
    ///
    /// Entries are re-filtered; expired ones are deleted, ones stored under
    /// a stale key are moved, and unreadable ones are skipped.
    pub async fn load_persistent_cache(&self) -> usize {
        let Some(persistence) = &self.persistence else {
            return 0;
        };
        let keys = match persistence.manager.list_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("{}: cannot list persistent cache: {}", self.id, e);
                return 0;
            }
        };
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();

        let now = self.clock.now();
        let context = FilterContext::new(self.id.clone(), now);
        let mut loaded = 0;

        for key in keys {
            if self.shutdown.is_cancelled() {
                break;
            }

            let descriptor = match persistence.manager.load(&key).await {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}: skipping unreadable persisted entry {}: {}", self.id, key, e);
                    continue;
                }
            };

            let descriptors = match self
                .warm_start_filters
                .apply(MetadataDocument::Entity(descriptor), &context)
            {
                Ok(Some(document)) => document.into_descriptors(),
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}: skipping persisted entry {}: {}", self.id, key, e);
                    continue;
                }
            };

            for descriptor in descriptors {
                if !descriptor.is_valid_at(now) {
                    debug!("{}: dropping expired persisted {}", self.id, descriptor.entity_id);
                    if let Err(e) = persistence.manager.remove(&key).await {
                        warn!("{}: failed to remove {}: {}", self.id, key, e);
                    }
                    continue;
                }

                let expected = (persistence.key_generator)(&descriptor);
                if expected != key {
                    match persistence.manager.rename_key(&key, &expected).await {
                        Ok(_) => debug!("{}: moved persisted {} to {}", self.id, key, expected),
                        Err(MetadataError::AlreadyExists(_)) => {
                            if let Err(e) = persistence.manager.remove(&key).await {
                                warn!("{}: failed to remove {}: {}", self.id, key, e);
                            }
                        }
                        Err(e) => warn!("{}: failed to move {}: {}", self.id, key, e),
                    }
                }

                // Resolved while warming up; keep the fresher copy
                if self.store.contains(&descriptor.entity_id) {
                    continue;
                }
                let entity_id = descriptor.entity_id.clone();
                if !self.insert_records(&entity_id, vec![descriptor], now).is_empty() {
                    loaded += 1;
                }
            }
        }

        self.update_size_gauge();
        info!("{}: loaded {} entities from persistent cache", self.id, loaded);
        loaded
    }
}

/// Post-filter results against criteria the fetch may not have honoured
fn apply_predicates(
    mut descriptors: Vec<Arc<EntityDescriptor>>,
    criteria: &CriteriaSet,
) -> Vec<Arc<EntityDescriptor>> {
    if let Some(role) = criteria.role() {
        descriptors.retain(|d| d.has_role(role));
    }
    descriptors
}
