/// Metadata documents as fetched from an origin
use super::descriptor::{DocumentSignature, EntityDescriptor};
use crate::error::{MetadataError, MetadataResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Group of entities, possibly nested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitiesDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_duration: Option<u64>,
    pub entities: Vec<EntityDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<EntitiesDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DocumentSignature>,
}

impl EntitiesDescriptor {
    pub fn new(entities: Vec<EntityDescriptor>) -> Self {
        Self {
            name: None,
            valid_until: None,
            cache_duration: None,
            entities,
            groups: Vec::new(),
            signature: None,
        }
    }

    pub fn signing_input(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.groups.iter().all(|g| g.is_empty())
    }

    /// Flatten nested groups, pushing the tightest ancestor validity down
    fn flatten_into(
        self,
        valid_until: Option<DateTime<Utc>>,
        cache_duration: Option<u64>,
        out: &mut Vec<EntityDescriptor>,
    ) {
        let valid_until = min_option(valid_until, self.valid_until);
        let cache_duration = min_option(cache_duration, self.cache_duration);

        for mut entity in self.entities {
            entity.valid_until = min_option(entity.valid_until, valid_until);
            entity.cache_duration = min_option(entity.cache_duration, cache_duration);
            out.push(entity);
        }
        for group in self.groups {
            group.flatten_into(valid_until, cache_duration, out);
        }
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Root of a fetched document: a single entity or a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataDocument {
    Entity(EntityDescriptor),
    Entities(EntitiesDescriptor),
}

impl MetadataDocument {
    /// Parse the JSON wire form
    ///
    /// A single-entity root keeps its serialized form until it is cached.
    pub fn parse(bytes: &[u8]) -> MetadataResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let object = value.as_object().ok_or_else(|| {
            MetadataError::FetchFailed("Metadata document root is not an object".to_string())
        })?;

        if object.contains_key("entityID") {
            let mut entity: EntityDescriptor = serde_json::from_value(value)?;
            entity.serialized = Some(String::from_utf8_lossy(bytes).into_owned());
            Ok(MetadataDocument::Entity(entity))
        } else if object.contains_key("entities") {
            Ok(MetadataDocument::Entities(serde_json::from_value(value)?))
        } else {
            Err(MetadataError::FetchFailed(
                "Metadata document root is neither an entity nor an entities group".to_string(),
            ))
        }
    }

    pub fn root_valid_until(&self) -> Option<DateTime<Utc>> {
        match self {
            MetadataDocument::Entity(e) => e.valid_until,
            MetadataDocument::Entities(g) => g.valid_until,
        }
    }

    pub fn root_cache_duration(&self) -> Option<u64> {
        match self {
            MetadataDocument::Entity(e) => e.cache_duration,
            MetadataDocument::Entities(g) => g.cache_duration,
        }
    }

    pub fn root_signature(&self) -> Option<&DocumentSignature> {
        match self {
            MetadataDocument::Entity(e) => e.signature.as_ref(),
            MetadataDocument::Entities(g) => g.signature.as_ref(),
        }
    }

    pub fn signing_input(&self) -> Vec<u8> {
        match self {
            MetadataDocument::Entity(e) => e.signing_input(),
            MetadataDocument::Entities(g) => g.signing_input(),
        }
    }

    /// All entity descriptors, with inherited validity applied
    pub fn into_descriptors(self) -> Vec<EntityDescriptor> {
        match self {
            MetadataDocument::Entity(e) => vec![e],
            MetadataDocument::Entities(g) => {
                let mut out = Vec::new();
                g.flatten_into(None, None, &mut out);
                out
            }
        }
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.clone()
            .into_descriptors()
            .into_iter()
            .map(|e| e.entity_id)
            .collect()
    }
}
