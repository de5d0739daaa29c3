/// Role allow-listing
use super::{map_entities, FilterContext, MetadataFilter};
use crate::{
    error::MetadataResult,
    metadata::{MetadataDocument, RoleType},
};
use std::collections::HashSet;
use tracing::debug;

/// Prunes role blocks not in the retained set
#[derive(Debug, Clone)]
pub struct EntityRoleFilter {
    retained_roles: HashSet<RoleType>,
    remove_roleless_entities: bool,
}

impl EntityRoleFilter {
    pub fn new(retained_roles: impl IntoIterator<Item = RoleType>) -> Self {
        Self {
            retained_roles: retained_roles.into_iter().collect(),
            remove_roleless_entities: true,
        }
    }

    /// Keep entities even when every role was pruned
    pub fn keep_roleless_entities(mut self) -> Self {
        self.remove_roleless_entities = false;
        self
    }
}

impl MetadataFilter for EntityRoleFilter {
    fn name(&self) -> &str {
        "EntityRole"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        _context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        map_entities(document, &mut |mut entity| {
            entity
                .roles
                .retain(|role| self.retained_roles.contains(&role.role));
            if entity.roles.is_empty() && self.remove_roleless_entities {
                debug!("Removing {}: no retained roles", entity.entity_id);
                return Ok(None);
            }
            Ok(Some(entity))
        })
    }
}
