/// Built-in secondary indexes
use super::MetadataIndex;
use crate::{criteria::CriteriaSet, metadata::EntityDescriptor};
use sha1::{Digest, Sha1};
use std::collections::HashSet;

/// SAML 2.0 artifact type code carrying a 20-byte SourceID
const SAML2_ARTIFACT_TYPE: [u8; 2] = [0x00, 0x04];
const SAML2_ARTIFACT_LEN: usize = 44;

/// Extract the hex SourceID from a type 0x0004 artifact
///
/// Layout: type code (2) | endpoint index (2) | SourceID (20) | message handle (20)
pub fn saml2_source_id(artifact: &[u8]) -> Option<String> {
    if artifact.len() != SAML2_ARTIFACT_LEN || artifact[0..2] != SAML2_ARTIFACT_TYPE {
        return None;
    }
    Some(hex::encode(&artifact[4..24]))
}

/// Hex SHA-1 of an entity ID, the default artifact SourceID
pub fn entity_id_source_id(entity_id: &str) -> String {
    hex::encode(Sha1::digest(entity_id.as_bytes()))
}

/// Artifact SourceID -> issuing entity
#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactSourceIdIndex;

impl MetadataIndex for ArtifactSourceIdIndex {
    fn name(&self) -> &str {
        "artifact-source-id"
    }

    fn descriptor_keys(&self, descriptor: &EntityDescriptor) -> HashSet<String> {
        let mut keys = HashSet::new();
        keys.insert(entity_id_source_id(&descriptor.entity_id));
        for role in &descriptor.roles {
            if let Some(source_id) = &role.source_id {
                keys.insert(source_id.to_ascii_lowercase());
            }
        }
        keys
    }

    fn criteria_keys(&self, criteria: &CriteriaSet) -> Option<HashSet<String>> {
        let source_id = saml2_source_id(criteria.artifact()?)?;
        Some(std::iter::once(source_id).collect())
    }
}

/// Role type -> entities carrying that role
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleIndex;

impl MetadataIndex for RoleIndex {
    fn name(&self) -> &str {
        "role"
    }

    fn descriptor_keys(&self, descriptor: &EntityDescriptor) -> HashSet<String> {
        descriptor
            .roles
            .iter()
            .map(|r| r.role.as_str().to_string())
            .collect()
    }

    fn criteria_keys(&self, criteria: &CriteriaSet) -> Option<HashSet<String>> {
        // Only used when the role is the whole query; alongside an entity ID
        // the role is a predicate, not a lookup key.
        if criteria.entity_id().is_some() || criteria.string_value().is_some() {
            return None;
        }
        let role = criteria.role()?;
        Some(std::iter::once(role.as_str().to_string()).collect())
    }
}

/// String criterion -> entities with a matching attribute value or registrar
#[derive(Debug, Default, Clone)]
pub struct EntityAttributeIndex {
    /// Restrict to these attribute names; empty means all
    attribute_names: Vec<String>,
}

impl EntityAttributeIndex {
    pub fn for_attributes(names: Vec<String>) -> Self {
        Self {
            attribute_names: names,
        }
    }

    fn includes(&self, name: &str) -> bool {
        self.attribute_names.is_empty() || self.attribute_names.iter().any(|n| n == name)
    }
}

impl MetadataIndex for EntityAttributeIndex {
    fn name(&self) -> &str {
        "entity-attribute"
    }

    fn descriptor_keys(&self, descriptor: &EntityDescriptor) -> HashSet<String> {
        let mut keys: HashSet<String> = descriptor
            .attributes
            .iter()
            .filter(|(name, _)| self.includes(name))
            .flat_map(|(_, values)| values.iter().cloned())
            .collect();
        if let Some(registrar) = &descriptor.registration_authority {
            keys.insert(registrar.clone());
        }
        keys
    }

    fn criteria_keys(&self, criteria: &CriteriaSet) -> Option<HashSet<String>> {
        let value = criteria.string_value()?;
        Some(std::iter::once(value.to_string()).collect())
    }
}
