/// Storage-service-backed artifact map
use super::{validate_artifact, ArtifactMap, ArtifactMapEntry};
use crate::{
    clock::Clock,
    error::{MetadataError, MetadataResult},
    metrics,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::warn;

/// Key/value storage with per-record expiration
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Create a record; `false` if an unexpired record already holds the key
    async fn create(
        &self,
        context: &str,
        key: &str,
        value: &str,
        expiration: DateTime<Utc>,
    ) -> MetadataResult<bool>;

    async fn read(&self, context: &str, key: &str) -> MetadataResult<Option<String>>;

    async fn delete(&self, context: &str, key: &str) -> MetadataResult<bool>;
}

/// In-process storage service; expiry is enforced on access
pub struct MemoryStorageService {
    records: DashMap<(String, String), (String, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorageService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    fn record_key(context: &str, key: &str) -> (String, String) {
        (context.to_string(), key.to_string())
    }
}

#[async_trait]
impl StorageService for MemoryStorageService {
    async fn create(
        &self,
        context: &str,
        key: &str,
        value: &str,
        expiration: DateTime<Utc>,
    ) -> MetadataResult<bool> {
        let now = self.clock.now();
        match self.records.entry(Self::record_key(context, key)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    return Ok(false);
                }
                occupied.insert((value.to_string(), expiration));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_string(), expiration));
                Ok(true)
            }
        }
    }

    async fn read(&self, context: &str, key: &str) -> MetadataResult<Option<String>> {
        let now = self.clock.now();
        let record_key = Self::record_key(context, key);
        let Some(record) = self.records.get(&record_key).map(|r| r.clone()) else {
            return Ok(None);
        };
        if record.1 <= now {
            self.records.remove_if(&record_key, |_, (_, until)| *until <= now);
            return Ok(None);
        }
        Ok(Some(record.0))
    }

    async fn delete(&self, context: &str, key: &str) -> MetadataResult<bool> {
        Ok(self.records.remove(&Self::record_key(context, key)).is_some())
    }
}

/// Storage context artifacts are filed under
pub const ARTIFACT_CONTEXT: &str = "artifact";

/// Artifact map over a `StorageService`
///
/// `put` never overwrites: an existing artifact fails with
/// `DuplicateArtifact`.
pub struct StorageArtifactMap {
    storage: Arc<dyn StorageService>,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl StorageArtifactMap {
    pub fn new(storage: Arc<dyn StorageService>, lifetime: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            lifetime,
            clock,
        }
    }
}

#[async_trait]
impl ArtifactMap for StorageArtifactMap {
    async fn contains(&self, artifact: &str) -> MetadataResult<bool> {
        Ok(self.get(artifact).await?.is_some())
    }

    async fn get(&self, artifact: &str) -> MetadataResult<Option<ArtifactMapEntry>> {
        let Some(value) = self.storage.read(ARTIFACT_CONTEXT, artifact).await? else {
            metrics::record_artifact_operation("get", "miss");
            return Ok(None);
        };

        let entry: ArtifactMapEntry = match serde_json::from_str(&value) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding unreadable artifact {}: {}", artifact, e);
                self.storage.delete(ARTIFACT_CONTEXT, artifact).await?;
                return Ok(None);
            }
        };

        // The store's native expiry may lag the clock
        if entry.is_expired(self.clock.now()) {
            self.storage.delete(ARTIFACT_CONTEXT, artifact).await?;
            metrics::record_artifact_operation("get", "expired");
            return Ok(None);
        }
        metrics::record_artifact_operation("get", "hit");
        Ok(Some(entry))
    }

    async fn put(
        &self,
        artifact: &str,
        relying_party_id: &str,
        issuer_id: &str,
        message: &str,
    ) -> MetadataResult<()> {
        validate_artifact(artifact)?;
        let entry = ArtifactMapEntry {
            artifact: artifact.to_string(),
            issuer_id: issuer_id.to_string(),
            relying_party_id: relying_party_id.to_string(),
            message: message.to_string(),
            expiration: self.clock.now() + self.lifetime,
        };
        let value = serde_json::to_string(&entry)?;

        if !self
            .storage
            .create(ARTIFACT_CONTEXT, artifact, &value, entry.expiration)
            .await?
        {
            metrics::record_artifact_operation("put", "duplicate");
            return Err(MetadataError::DuplicateArtifact(artifact.to_string()));
        }
        metrics::record_artifact_operation("put", "success");
        Ok(())
    }

    async fn remove(&self, artifact: &str) -> MetadataResult<()> {
        self.storage.delete(ARTIFACT_CONTEXT, artifact).await?;
        metrics::record_artifact_operation("remove", "success");
        Ok(())
    }
}
