/// Artifact map: short-lived artifact -> protocol message indirection
///
/// Two implementations share the `ArtifactMap` contract:
/// - `InMemoryArtifactMap`: concurrent map swept by a background job
/// - `StorageArtifactMap`: delegates expiry to a `StorageService`, refusing
///   to overwrite an existing artifact

pub mod memory;
pub mod redis;
pub mod storage;

pub use memory::InMemoryArtifactMap;
pub use self::redis::RedisStorageService;
pub use storage::{MemoryStorageService, StorageArtifactMap, StorageService};

use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default artifact lifetime in seconds
pub const DEFAULT_ARTIFACT_LIFETIME_SECS: i64 = 60 * 4;

/// A stored artifact and the message it stands for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMapEntry {
    pub artifact: String,
    pub issuer_id: String,
    pub relying_party_id: String,
    /// Serialized protocol message
    pub message: String,
    pub expiration: DateTime<Utc>,
}

impl ArtifactMapEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

#[async_trait]
pub trait ArtifactMap: Send + Sync {
    /// True if an unexpired entry exists
    async fn contains(&self, artifact: &str) -> MetadataResult<bool>;

    /// The entry, or `None` if absent or expired (expired entries are deleted)
    async fn get(&self, artifact: &str) -> MetadataResult<Option<ArtifactMapEntry>>;

    /// Store a message under an artifact for the configured lifetime
    async fn put(
        &self,
        artifact: &str,
        relying_party_id: &str,
        issuer_id: &str,
        message: &str,
    ) -> MetadataResult<()>;

    async fn remove(&self, artifact: &str) -> MetadataResult<()>;

    /// Evict expired entries; backends with native expiry have nothing to do
    async fn sweep(&self) -> MetadataResult<usize> {
        Ok(0)
    }
}

pub(crate) fn validate_artifact(artifact: &str) -> MetadataResult<()> {
    if artifact.trim().is_empty() {
        return Err(MetadataError::InvalidArgument(
            "artifact cannot be empty".to_string(),
        ));
    }
    Ok(())
}
