/// Secondary index manager
use super::MetadataIndex;
use crate::{criteria::CriteriaSet, metadata::EntityDescriptor};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Tables for one configured index
struct IndexTable {
    index: Arc<dyn MetadataIndex>,
    /// index key -> entity IDs
    entries: DashMap<String, HashSet<String>>,
    /// entity ID -> index keys it is currently filed under
    by_entity: DashMap<String, HashSet<String>>,
}

impl IndexTable {
    fn new(index: Arc<dyn MetadataIndex>) -> Self {
        Self {
            index,
            entries: DashMap::new(),
            by_entity: DashMap::new(),
        }
    }

    fn remove_entity(&self, entity_id: &str) {
        if let Some((_, keys)) = self.by_entity.remove(entity_id) {
            for key in keys {
                let now_empty = match self.entries.get_mut(&key) {
                    Some(mut ids) => {
                        ids.remove(entity_id);
                        ids.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.entries.remove_if(&key, |_, ids| ids.is_empty());
                }
            }
        }
    }

    fn add_entity(&self, entity_id: &str, keys: HashSet<String>) {
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.entries
                .entry(key.clone())
                .or_default()
                .insert(entity_id.to_string());
        }
        self.by_entity.insert(entity_id.to_string(), keys);
    }
}

/// Maintains index key -> entity ID sets, one table per index
///
/// Callers serialize updates for a given entity ID (the backing store does
/// this while holding that entity's primary entry).
pub struct SecondaryIndexManager {
    tables: Vec<IndexTable>,
}

impl SecondaryIndexManager {
    pub fn new(indexes: Vec<Arc<dyn MetadataIndex>>) -> Self {
        Self {
            tables: indexes.into_iter().map(IndexTable::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|t| t.index.name().to_string())
            .collect()
    }

    /// Re-file an entity under the keys of its current descriptors
    ///
    /// Stale associations for the entity are dropped first, so this is
    /// idempotent.
    pub fn index_descriptors(&self, entity_id: &str, descriptors: &[Arc<EntityDescriptor>]) {
        for table in &self.tables {
            table.remove_entity(entity_id);
            let keys: HashSet<String> = descriptors
                .iter()
                .flat_map(|d| table.index.descriptor_keys(d))
                .collect();
            debug!(
                "Indexing {} under {} key(s) in {}",
                entity_id,
                keys.len(),
                table.index.name()
            );
            table.add_entity(entity_id, keys);
        }
    }

    /// Drop every association for an entity
    pub fn deindex(&self, entity_id: &str) {
        for table in &self.tables {
            table.remove_entity(entity_id);
        }
    }

    /// Entity IDs matching the criteria
    ///
    /// Returns `None` when no configured index supports the criteria, and
    /// the union of matches across supporting indexes otherwise.
    pub fn lookup(&self, criteria: &CriteriaSet) -> Option<HashSet<String>> {
        let mut supported = false;
        let mut result = HashSet::new();

        for table in &self.tables {
            let Some(keys) = table.index.criteria_keys(criteria) else {
                continue;
            };
            supported = true;
            for key in keys {
                if let Some(ids) = table.entries.get(&key) {
                    result.extend(ids.iter().cloned());
                }
            }
        }

        supported.then_some(result)
    }

    /// Entity IDs filed under `key` in the named index
    pub fn entities_for(&self, index_name: &str, key: &str) -> HashSet<String> {
        self.tables
            .iter()
            .filter(|t| t.index.name() == index_name)
            .filter_map(|t| t.entries.get(key).map(|ids| (*ids).clone()))
            .flatten()
            .collect()
    }

    /// True if the entity is filed in any index
    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.tables
            .iter()
            .any(|t| t.by_entity.contains_key(entity_id))
    }

    pub fn clear(&self) {
        for table in &self.tables {
            table.entries.clear();
            table.by_entity.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use crate::index::EntityAttributeIndex;

    fn manager() -> SecondaryIndexManager {
        SecondaryIndexManager::new(vec![Arc::new(EntityAttributeIndex::default())])
    }

    fn descriptor(id: &str, value: &str) -> Arc<EntityDescriptor> {
        Arc::new(EntityDescriptor::new(id).with_attribute("category", value))
    }

    #[test]
    fn test_lookup_after_index() {
        let manager = manager();
        manager.index_descriptors("e1", &[descriptor("e1", "v1")]);
        manager.index_descriptors("e2", &[descriptor("e2", "v1")]);

        let criteria = CriteriaSet::new().with(Criterion::string("v1").unwrap());
        let hits = manager.lookup(&criteria).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.contains("e1"));
        assert!(hits.contains("e2"));
    }

    #[test]
    fn test_reindex_drops_stale_keys() {
        let manager = manager();
        manager.index_descriptors("e1", &[descriptor("e1", "old")]);
        manager.index_descriptors("e1", &[descriptor("e1", "new")]);

        assert!(manager.entities_for("entity-attribute", "old").is_empty());
        assert!(manager.entities_for("entity-attribute", "new").contains("e1"));
    }

    #[test]
    fn test_deindex() {
        let manager = manager();
        manager.index_descriptors("e1", &[descriptor("e1", "v")]);
        assert!(manager.contains_entity("e1"));

        manager.deindex("e1");
        assert!(!manager.contains_entity("e1"));

        let criteria = CriteriaSet::new().with(Criterion::string("v").unwrap());
        assert_eq!(manager.lookup(&criteria), Some(HashSet::new()));
    }

    #[test]
    fn test_unsupported_criteria() {
        let manager = manager();
        let criteria = CriteriaSet::for_entity_id("https://sp.example.org").unwrap();
        assert!(manager.lookup(&criteria).is_none());
    }
}
