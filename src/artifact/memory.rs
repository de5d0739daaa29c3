/// In-memory artifact map
use super::{validate_artifact, ArtifactMap, ArtifactMapEntry};
use crate::{clock::Clock, error::MetadataResult, metrics};
use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent map of artifacts; expired entries linger until read or swept
pub struct InMemoryArtifactMap {
    entries: DashMap<String, ArtifactMapEntry>,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryArtifactMap {
    pub fn new(lifetime: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            lifetime,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ArtifactMap for InMemoryArtifactMap {
    async fn contains(&self, artifact: &str) -> MetadataResult<bool> {
        Ok(self.get(artifact).await?.is_some())
    }

    async fn get(&self, artifact: &str) -> MetadataResult<Option<ArtifactMapEntry>> {
        let now = self.clock.now();
        let entry = match self.entries.get(artifact) {
            Some(entry) => entry.clone(),
            None => {
                metrics::record_artifact_operation("get", "miss");
                return Ok(None);
            }
        };

        if entry.is_expired(now) {
            self.entries
                .remove_if(artifact, |_, current| current.is_expired(now));
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
        self.entries.insert(artifact.to_string(), entry);
        metrics::record_artifact_operation("put", "success");
        Ok(())
    }

    async fn remove(&self, artifact: &str) -> MetadataResult<()> {
        self.entries.remove(artifact);
        metrics::record_artifact_operation("remove", "success");
        Ok(())
    }

    async fn sweep(&self) -> MetadataResult<usize> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!("Swept {} expired artifact(s)", evicted);
        }
        Ok(evicted)
    }
}
