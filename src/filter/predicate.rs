/// Entity ID include/exclude lists
use super::{map_entities, FilterContext, MetadataFilter};
use crate::{error::MetadataResult, metadata::MetadataDocument};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateMode {
    /// Keep only the listed entities
    Include,
    /// Drop the listed entities
    Exclude,
}

#[derive(Debug, Clone)]
pub struct EntityIdPredicateFilter {
    mode: PredicateMode,
    entity_ids: HashSet<String>,
}

impl EntityIdPredicateFilter {
    pub fn new<I, S>(mode: PredicateMode, entity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode,
            entity_ids: entity_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl MetadataFilter for EntityIdPredicateFilter {
    fn name(&self) -> &str {
        "EntityIdPredicate"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        _context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        map_entities(document, &mut |entity| {
            let listed = self.entity_ids.contains(&entity.entity_id);
            let keep = match self.mode {
                PredicateMode::Include => listed,
                PredicateMode::Exclude => !listed,
            };
            Ok(keep.then_some(entity))
        })
    }
}
