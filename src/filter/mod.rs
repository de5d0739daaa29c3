/// Filter pipeline applied to freshly fetched metadata
///
/// Filters run in configured order. Each may transform the document,
/// return `None` to suppress it (treated as "not found"), or fail to signal
/// malformed or untrusted data.

pub mod annotate;
pub mod predicate;
pub mod roles;
pub mod schema;
pub mod signature;
pub mod validity;

pub use annotate::{AlgorithmAnnotationFilter, NameIdFormatFilter};
pub use predicate::{EntityIdPredicateFilter, PredicateMode};
pub use roles::EntityRoleFilter;
pub use schema::SchemaValidationFilter;
pub use signature::{K256TrustEngine, SignatureTrustEngine, SignatureValidationFilter};
pub use validity::RequiredValidUntilFilter;

use crate::{
    error::{MetadataError, MetadataResult},
    metadata::{EntitiesDescriptor, EntityDescriptor, MetadataDocument},
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Per-run information handed to every filter
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub now: DateTime<Utc>,
    /// Resolver that fetched the document
    pub source: String,
}

impl FilterContext {
    pub fn new(source: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            now,
            source: source.into(),
        }
    }
}

/// One stage of the pipeline
pub trait MetadataFilter: Send + Sync {
    fn name(&self) -> &str;

    fn filter(
        &self,
        document: MetadataDocument,
        context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>>;
}

/// Ordered list of filters
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn MetadataFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn MetadataFilter>>) -> Self {
        Self { filters }
    }

    pub fn with(mut self, filter: impl MetadataFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn push(&mut self, filter: Arc<dyn MetadataFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    /// Run every filter in order
    ///
    /// Errors other than `FilterFailed` are reported as a failure of the
    /// filter that raised them.
    pub fn apply(
        &self,
        document: MetadataDocument,
        context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        let mut current = document;
        for filter in &self.filters {
            match filter.filter(current, context) {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    debug!("Filter {} suppressed document from {}", filter.name(), context.source);
                    return Ok(None);
                }
                Err(e @ MetadataError::FilterFailed { .. }) => return Err(e),
                Err(e) => return Err(MetadataError::filter_failed(filter.name(), e.to_string())),
            }
        }
        Ok(Some(current))
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Apply `f` to every entity of a document, dropping those it rejects
///
/// Nested groups left empty are removed; an emptied root group is kept.
pub(crate) fn map_entities<F>(
    document: MetadataDocument,
    f: &mut F,
) -> MetadataResult<Option<MetadataDocument>>
where
    F: FnMut(EntityDescriptor) -> MetadataResult<Option<EntityDescriptor>>,
{
    match document {
        MetadataDocument::Entity(entity) => Ok(f(entity)?.map(MetadataDocument::Entity)),
        MetadataDocument::Entities(group) => {
            Ok(Some(MetadataDocument::Entities(map_group(group, f)?)))
        }
    }
}

fn map_group<F>(mut group: EntitiesDescriptor, f: &mut F) -> MetadataResult<EntitiesDescriptor>
where
    F: FnMut(EntityDescriptor) -> MetadataResult<Option<EntityDescriptor>>,
{
    let mut entities = Vec::with_capacity(group.entities.len());
    for entity in group.entities {
        if let Some(entity) = f(entity)? {
            entities.push(entity);
        }
    }
    group.entities = entities;

    let mut groups = Vec::with_capacity(group.groups.len());
    for child in group.groups {
        let child = map_group(child, f)?;
        if !child.is_empty() {
            groups.push(child);
        }
    }
    group.groups = groups;

    Ok(group)
}

/// Predicate over descriptors used to target annotation rules
pub type EntityPredicate = Arc<dyn Fn(&EntityDescriptor) -> bool + Send + Sync>;

/// Matches entities whose ID is in `ids`
pub fn entity_id_in<I, S>(ids: I) -> EntityPredicate
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let ids: HashSet<String> = ids.into_iter().map(Into::into).collect();
    Arc::new(move |ed: &EntityDescriptor| ids.contains(&ed.entity_id))
}

/// Matches entities carrying the attribute value
pub fn has_attribute(name: impl Into<String>, value: impl Into<String>) -> EntityPredicate {
    let name = name.into();
    let value = value.into();
    Arc::new(move |ed: &EntityDescriptor| {
        ed.attributes
            .get(&name)
            .map_or(false, |values| values.contains(&value))
    })
}

/// Matches entities registered by the given authority
pub fn registered_by(authority: impl Into<String>) -> EntityPredicate {
    let authority = authority.into();
    Arc::new(move |ed: &EntityDescriptor| {
        ed.registration_authority.as_deref() == Some(authority.as_str())
    })
}
