/// Entity descriptor model
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Role block types carried by an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoleType {
    IdpSso,
    SpSso,
    AttributeAuthority,
    AuthnAuthority,
    Pdp,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::IdpSso => "idpSso",
            RoleType::SpSso => "spSso",
            RoleType::AttributeAuthority => "attributeAuthority",
            RoleType::AuthnAuthority => "authnAuthority",
            RoleType::Pdp => "pdp",
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "idpSso" | "IDPSSODescriptor" => Ok(RoleType::IdpSso),
            "spSso" | "SPSSODescriptor" => Ok(RoleType::SpSso),
            "attributeAuthority" | "AttributeAuthorityDescriptor" => {
                Ok(RoleType::AttributeAuthority)
            }
            "authnAuthority" | "AuthnAuthorityDescriptor" => Ok(RoleType::AuthnAuthority),
            "pdp" | "PDPDescriptor" => Ok(RoleType::Pdp),
            other => Err(format!("Unknown role type: {}", other)),
        }
    }
}

/// Protocol endpoint within a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Endpoint element name, e.g. "SingleSignOnService"
    pub kind: String,
    pub binding: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u16>,
}

/// One role block of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDescriptor {
    pub role: RoleType,
    #[serde(default)]
    pub protocol_support: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_id_formats: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    /// Hex artifact SourceID declared by the role, when it differs from SHA-1(entityID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl RoleDescriptor {
    pub fn new(role: RoleType, protocol: impl Into<String>) -> Self {
        Self {
            role,
            protocol_support: vec![protocol.into()],
            name_id_formats: Vec::new(),
            endpoints: Vec::new(),
            source_id: None,
        }
    }
}

/// Detached signature over the canonical JSON form of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSignature {
    /// Name of the trusted key that produced the signature
    pub key_name: String,
    pub algorithm: String,
    /// Hex-encoded signature bytes
    pub value: String,
}

/// Algorithm capabilities injected by annotation filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub digest_methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signing_methods: Vec<String>,
}

impl Extensions {
    pub fn is_empty(&self) -> bool {
        self.digest_methods.is_empty() && self.signing_methods.is_empty()
    }
}

/// Metadata for a single federation entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    #[serde(rename = "entityID")]
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Cache duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_authority: Option<String>,
    /// Entity attributes (name -> values), e.g. entity categories
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    pub extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DocumentSignature>,
    /// Wire form the descriptor was parsed from; dropped once cached
    #[serde(skip)]
    pub serialized: Option<String>,
}

impl EntityDescriptor {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            roles: Vec::new(),
            valid_until: None,
            cache_duration: None,
            registration_authority: None,
            attributes: BTreeMap::new(),
            extensions: Extensions::default(),
            signature: None,
            serialized: None,
        }
    }

    pub fn with_role(mut self, role: RoleDescriptor) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = Some(duration.num_seconds().max(0) as u64);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn cache_duration(&self) -> Option<Duration> {
        self.cache_duration
            .map(|secs| Duration::seconds(secs.min(i64::MAX as u64) as i64))
    }

    pub fn has_role(&self, role: RoleType) -> bool {
        self.roles.iter().any(|r| r.role == role)
    }

    pub fn role(&self, role: RoleType) -> Option<&RoleDescriptor> {
        self.roles.iter().find(|r| r.role == role)
    }

    /// True unless validUntil has passed
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map_or(true, |until| until > now)
    }

    /// Bytes covered by the signature: canonical JSON without the signature
    pub fn signing_input(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    /// Copy suitable for long-lived caching
    pub fn without_serialized(mut self) -> Self {
        self.serialized = None;
        self
    }
}
