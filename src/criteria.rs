/// Typed query inputs for metadata resolution
///
/// A `CriteriaSet` holds at most one criterion per kind; adding a second
/// criterion of the same kind replaces the first.
use crate::{
    error::{MetadataError, MetadataResult},
    metadata::RoleType,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;
use std::fmt;

/// Discriminant of a criterion, used as the set key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriterionKind {
    EntityId,
    Artifact,
    EntityRole,
    String,
}

/// A single query input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Federation-unique entity identifier
    EntityId(String),
    /// Raw (decoded) artifact bytes
    Artifact(Vec<u8>),
    /// Role the resolved entity must carry
    EntityRole(RoleType),
    /// Opaque string matched through secondary indexes
    String(String),
}

impl Criterion {
    pub fn entity_id(id: impl Into<String>) -> MetadataResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MetadataError::InvalidArgument(
                "entity ID criterion cannot be empty".to_string(),
            ));
        }
        Ok(Criterion::EntityId(id))
    }

    pub fn artifact(bytes: impl Into<Vec<u8>>) -> MetadataResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(MetadataError::InvalidArgument(
                "artifact criterion cannot be empty".to_string(),
            ));
        }
        Ok(Criterion::Artifact(bytes))
    }

    /// Build an artifact criterion from its base64 wire form
    pub fn artifact_base64(encoded: &str) -> MetadataResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| MetadataError::InvalidArgument(format!("Invalid artifact encoding: {}", e)))?;
        Self::artifact(bytes)
    }

    pub fn role(role: RoleType) -> Self {
        Criterion::EntityRole(role)
    }

    pub fn string(value: impl Into<String>) -> MetadataResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(MetadataError::InvalidArgument(
                "string criterion cannot be empty".to_string(),
            ));
        }
        Ok(Criterion::String(value))
    }

    pub fn kind(&self) -> CriterionKind {
        match self {
            Criterion::EntityId(_) => CriterionKind::EntityId,
            Criterion::Artifact(_) => CriterionKind::Artifact,
            Criterion::EntityRole(_) => CriterionKind::EntityRole,
            Criterion::String(_) => CriterionKind::String,
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::EntityId(id) => write!(f, "entityID={}", id),
            Criterion::Artifact(bytes) => write!(f, "artifact={}", STANDARD.encode(bytes)),
            Criterion::EntityRole(role) => write!(f, "role={}", role),
            Criterion::String(value) => write!(f, "value={}", value),
        }
    }
}

/// Set of criteria, at most one per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriteriaSet {
    criteria: HashMap<CriterionKind, Criterion>,
}

impl CriteriaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for the common single-entity lookup
    pub fn for_entity_id(id: impl Into<String>) -> MetadataResult<Self> {
        Ok(Self::new().with(Criterion::entity_id(id)?))
    }

    /// Add a criterion, replacing any existing one of the same kind
    pub fn add(&mut self, criterion: Criterion) -> Option<Criterion> {
        self.criteria.insert(criterion.kind(), criterion)
    }

    pub fn with(mut self, criterion: Criterion) -> Self {
        self.add(criterion);
        self
    }

    pub fn get(&self, kind: CriterionKind) -> Option<&Criterion> {
        self.criteria.get(&kind)
    }

    pub fn contains(&self, kind: CriterionKind) -> bool {
        self.criteria.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn entity_id(&self) -> Option<&str> {
        match self.get(CriterionKind::EntityId) {
            Some(Criterion::EntityId(id)) => Some(id),
            _ => None,
        }
    }

    pub fn artifact(&self) -> Option<&[u8]> {
        match self.get(CriterionKind::Artifact) {
            Some(Criterion::Artifact(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<RoleType> {
        match self.get(CriterionKind::EntityRole) {
            Some(Criterion::EntityRole(role)) => Some(*role),
            _ => None,
        }
    }

    pub fn string_value(&self) -> Option<&str> {
        match self.get(CriterionKind::String) {
            Some(Criterion::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.values()
    }
}

impl FromIterator<Criterion> for CriteriaSet {
    fn from_iter<I: IntoIterator<Item = Criterion>>(iter: I) -> Self {
        let mut set = CriteriaSet::new();
        for criterion in iter {
            set.add(criterion);
        }
        set
    }
}

impl fmt::Display for CriteriaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Stable order keeps log lines comparable
        let mut parts: Vec<String> = self.criteria.values().map(|c| c.to_string()).collect();
        parts.sort();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
