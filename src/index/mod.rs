/// Secondary indexes over resolved descriptors
///
/// A `MetadataIndex` maps descriptors and criteria into the same space of
/// index keys. The `SecondaryIndexManager` keeps one key -> entityIDs table
/// per configured index so criteria without an entity ID can still hit
/// the cache.

pub mod builtin;
pub mod manager;

pub use builtin::{saml2_source_id, ArtifactSourceIdIndex, EntityAttributeIndex, RoleIndex};
pub use manager::SecondaryIndexManager;

use crate::{criteria::CriteriaSet, metadata::EntityDescriptor};
use std::collections::HashSet;
use std::sync::Arc;

/// Pluggable pair of key extraction functions
pub trait MetadataIndex: Send + Sync {
    /// Name used in logs and lookups
    fn name(&self) -> &str;

    /// Keys a cached descriptor is reachable under
    fn descriptor_keys(&self, descriptor: &EntityDescriptor) -> HashSet<String>;

    /// Keys to look up for the criteria, or `None` if this index does not
    /// understand any of them
    fn criteria_keys(&self, criteria: &CriteriaSet) -> Option<HashSet<String>>;
}

type DescriptorKeyFn = dyn Fn(&EntityDescriptor) -> HashSet<String> + Send + Sync;
type CriteriaKeyFn = dyn Fn(&CriteriaSet) -> Option<HashSet<String>> + Send + Sync;

/// Index assembled from two closures
#[derive(Clone)]
pub struct FunctionIndex {
    name: String,
    descriptor_fn: Arc<DescriptorKeyFn>,
    criteria_fn: Arc<CriteriaKeyFn>,
}

impl FunctionIndex {
    pub fn new<D, C>(name: impl Into<String>, descriptor_fn: D, criteria_fn: C) -> Self
    where
        D: Fn(&EntityDescriptor) -> HashSet<String> + Send + Sync + 'static,
        C: Fn(&CriteriaSet) -> Option<HashSet<String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            descriptor_fn: Arc::new(descriptor_fn),
            criteria_fn: Arc::new(criteria_fn),
        }
    }
}

impl MetadataIndex for FunctionIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor_keys(&self, descriptor: &EntityDescriptor) -> HashSet<String> {
        (self.descriptor_fn)(descriptor)
    }

    fn criteria_keys(&self, criteria: &CriteriaSet) -> Option<HashSet<String>> {
        (self.criteria_fn)(criteria)
    }
}

impl std::fmt::Debug for FunctionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionIndex").field("name", &self.name).finish()
    }
}

/// Indexes enabled when none are configured explicitly
pub fn default_indexes() -> Vec<Arc<dyn MetadataIndex>> {
    vec![
        Arc::new(ArtifactSourceIdIndex),
        Arc::new(RoleIndex),
        Arc::new(EntityAttributeIndex::default()),
    ]
}
