/// Structural conformance checks
use super::{map_entities, FilterContext, MetadataFilter};
use crate::{
    error::{MetadataError, MetadataResult},
    metadata::{EntityDescriptor, MetadataDocument},
};

/// Longest entityID allowed by the metadata schema
pub const MAX_ENTITY_ID_LEN: usize = 1024;

/// Rejects documents containing descriptors that break the schema rules
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidationFilter;

/// Absolute URI check: a scheme followed by ':'
fn is_absolute_uri(value: &str) -> bool {
    match value.split_once(':') {
        Some((scheme, rest)) => {
            !rest.is_empty()
                && scheme
                    .chars()
                    .next()
                    .map_or(false, |c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn check_entity(entity: &EntityDescriptor) -> Result<(), String> {
    if entity.entity_id.is_empty() {
        return Err("entityID is empty".to_string());
    }
    if entity.entity_id.len() > MAX_ENTITY_ID_LEN {
        return Err(format!(
            "entityID longer than {} characters",
            MAX_ENTITY_ID_LEN
        ));
    }
    if !is_absolute_uri(&entity.entity_id) {
        return Err(format!("entityID '{}' is not an absolute URI", entity.entity_id));
    }

    for role in &entity.roles {
        if role.protocol_support.is_empty() {
            return Err(format!(
                "{} role of {} has no protocolSupportEnumeration",
                role.role, entity.entity_id
            ));
        }
        for endpoint in &role.endpoints {
            if endpoint.binding.is_empty() || !is_absolute_uri(&endpoint.location) {
                return Err(format!(
                    "{} endpoint of {} needs a binding and an absolute location",
                    endpoint.kind, entity.entity_id
                ));
            }
        }
    }
    Ok(())
}

impl MetadataFilter for SchemaValidationFilter {
    fn name(&self) -> &str {
        "SchemaValidation"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        _context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        let name = self.name();
        map_entities(document, &mut |entity| {
            check_entity(&entity).map_err(|reason| MetadataError::filter_failed(name, reason))?;
            Ok(Some(entity))
        })
    }
}
