/// Concurrent backing store of resolved descriptors
use crate::{
    criteria::CriteriaSet,
    index::{MetadataIndex, SecondaryIndexManager},
    metadata::EntityDescriptor,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// One cached descriptor with its lifetime bookkeeping
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub descriptor: Arc<EntityDescriptor>,
    pub expiration: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(descriptor: EntityDescriptor, expiration: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            expiration,
            last_access: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

/// Primary map entityID -> records, plus the secondary indexes
///
/// Index updates for an entity happen while its primary entry is held, so
/// an entity filed in an index is always present in the primary map.
pub struct BackingStore {
    entries: DashMap<String, Vec<CacheRecord>>,
    indexes: SecondaryIndexManager,
}

impl BackingStore {
    pub fn new(indexes: Vec<Arc<dyn MetadataIndex>>) -> Self {
        Self {
            entries: DashMap::new(),
            indexes: SecondaryIndexManager::new(indexes),
        }
    }

    /// Records for an entity, marking them accessed
    pub fn get(&self, entity_id: &str, now: DateTime<Utc>) -> Option<Vec<CacheRecord>> {
        let mut records = self.entries.get_mut(entity_id)?;
        for record in records.iter_mut() {
            record.last_access = now;
        }
        Some(records.clone())
    }

    /// Replace the records of an entity and re-index it
    pub fn insert(&self, entity_id: &str, records: Vec<CacheRecord>) {
        if records.is_empty() {
            self.remove(entity_id);
            return;
        }
        let descriptors: Vec<Arc<EntityDescriptor>> =
            records.iter().map(|r| Arc::clone(&r.descriptor)).collect();

        match self.entries.entry(entity_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(records);
                self.indexes.index_descriptors(entity_id, &descriptors);
            }
            Entry::Vacant(vacant) => {
                let _guard = vacant.insert(records);
                self.indexes.index_descriptors(entity_id, &descriptors);
            }
        }
    }

    /// Push out the expiration of every record of an entity
    pub fn extend_expiration(&self, entity_id: &str, until: DateTime<Utc>) -> bool {
        match self.entries.get_mut(entity_id) {
            Some(mut records) => {
                for record in records.iter_mut() {
                    record.expiration = record.expiration.max(until);
                }
                true
            }
            None => false,
        }
    }

    /// Remove an entity and its index associations
    pub fn remove(&self, entity_id: &str) -> Option<Vec<CacheRecord>> {
        match self.entries.entry(entity_id.to_string()) {
            Entry::Occupied(occupied) => {
                self.indexes.deindex(entity_id);
                Some(occupied.remove())
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Evict expired records, and idle ones when `max_idle` is set
    ///
    /// Works from a snapshot of the keys; entries added during the sweep
    /// may or may not be visited.
    pub fn cleanup(&self, now: DateTime<Utc>, max_idle: Option<Duration>) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut evicted = 0;

        for key in keys {
            let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) else {
                continue;
            };
            let before = occupied.get().len();
            occupied.get_mut().retain(|record| {
                let idle = max_idle.map_or(false, |max| now - record.last_access > max);
                !record.is_expired(now) && !idle
            });
            let remaining = occupied.get().len();
            evicted += before - remaining;

            if remaining == 0 {
                self.indexes.deindex(&key);
                occupied.remove();
                debug!("Evicted {} from backing store", key);
            } else if remaining != before {
                let descriptors: Vec<Arc<EntityDescriptor>> = occupied
                    .get()
                    .iter()
                    .map(|r| Arc::clone(&r.descriptor))
                    .collect();
                self.indexes.index_descriptors(&key, &descriptors);
            }
        }

        evicted
    }

    /// Entity IDs matching the criteria through secondary indexes
    pub fn lookup_indexed(&self, criteria: &CriteriaSet) -> Option<HashSet<String>> {
        self.indexes.lookup(criteria)
    }

    pub fn indexes(&self) -> &SecondaryIndexManager {
        &self.indexes
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use crate::index::default_indexes;
    use crate::metadata::{RoleDescriptor, RoleType};

    fn store() -> BackingStore {
        BackingStore::new(default_indexes())
    }

    fn idp(id: &str) -> EntityDescriptor {
        EntityDescriptor::new(id).with_role(RoleDescriptor::new(RoleType::IdpSso, "p"))
    }

    fn idp_criteria() -> CriteriaSet {
        CriteriaSet::new().with(Criterion::role(RoleType::IdpSso))
    }

    #[test]
    fn test_insert_indexes_entity() {
        let store = store();
        let now = Utc::now();
        store.insert(
            "https://idp.example.org",
            vec![CacheRecord::new(idp("https://idp.example.org"), now + Duration::hours(1), now)],
        );

        assert!(store.contains("https://idp.example.org"));
        assert!(store
            .lookup_indexed(&idp_criteria())
            .unwrap()
            .contains("https://idp.example.org"));
    }

    #[test]
    fn test_get_touches_last_access() {
        let store = store();
        let now = Utc::now();
        store.insert(
            "https://idp.example.org",
            vec![CacheRecord::new(idp("https://idp.example.org"), now + Duration::hours(1), now)],
        );

        let later = now + Duration::minutes(5);
        let records = store.get("https://idp.example.org", later).unwrap();
        assert_eq!(records[0].last_access, later);
    }

    #[test]
    fn test_cleanup_evicts_expired_and_deindexes() {
        let store = store();
        let now = Utc::now();
        store.insert(
            "https://old.example.org",
            vec![CacheRecord::new(idp("https://old.example.org"), now + Duration::minutes(1), now)],
        );
        store.insert(
            "https://new.example.org",
            vec![CacheRecord::new(idp("https://new.example.org"), now + Duration::hours(1), now)],
        );

        let evicted = store.cleanup(now + Duration::minutes(2), None);
        assert_eq!(evicted, 1);
        assert!(!store.contains("https://old.example.org"));
        assert!(!store.indexes().contains_entity("https://old.example.org"));

        let hits = store.lookup_indexed(&idp_criteria()).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits.contains("https://new.example.org"));
    }

    #[test]
    fn test_cleanup_evicts_idle() {
        let store = store();
        let now = Utc::now();
        store.insert(
            "https://idle.example.org",
            vec![CacheRecord::new(idp("https://idle.example.org"), now + Duration::days(1), now)],
        );

        assert_eq!(store.cleanup(now + Duration::hours(2), None), 0);
        assert_eq!(
            store.cleanup(now + Duration::hours(2), Some(Duration::hours(1))),
            1
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_extend_and_remove() {
        let store = store();
        let now = Utc::now();
        store.insert(
            "https://idp.example.org",
            vec![CacheRecord::new(idp("https://idp.example.org"), now, now)],
        );

        assert!(store.extend_expiration("https://idp.example.org", now + Duration::minutes(10)));
        assert_eq!(store.cleanup(now + Duration::minutes(5), None), 0);

        assert!(store.remove("https://idp.example.org").is_some());
        assert!(store.remove("https://idp.example.org").is_none());
        assert!(store.lookup_indexed(&idp_criteria()).unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let store = store();
        let now = Utc::now();
        for id in ["https://a.example.org", "https://b.example.org"] {
            store.insert(id, vec![CacheRecord::new(idp(id), now + Duration::hours(1), now)]);
        }
        store.clear();
        assert!(store.is_empty());
        assert!(!store.indexes().contains_entity("https://a.example.org"));
    }

    #[tokio::test]
    async fn test_concurrent_insert_and_cleanup() {
        let store = Arc::new(store());
        let now = Utc::now();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let id = format!("https://e{}-{}.example.org", worker, i);
                    let expiration = if i % 2 == 0 { now } else { now + Duration::hours(1) };
                    store.insert(&id, vec![CacheRecord::new(idp(&id), expiration, now)]);
                    store.cleanup(now + Duration::seconds(1), None);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.cleanup(now + Duration::seconds(1), None);

        assert_eq!(store.len(), 100);
        let indexed = store.lookup_indexed(&idp_criteria()).unwrap();
        assert_eq!(indexed.len(), 100);
        for id in indexed {
            assert!(store.contains(&id));
        }
    }
}
