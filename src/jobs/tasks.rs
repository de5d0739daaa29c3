/// Background task implementations
use crate::{
    artifact::ArtifactMap, error::MetadataResult, metrics, store::MetadataResolver,
};
use std::time::{Duration, Instant};

/// Evict expired and idle records from one resolver
pub fn cleanup_resolver(resolver: &MetadataResolver) -> usize {
    let start = Instant::now();
    let evicted = resolver.cleanup();
    metrics::record_background_job("resolver_cleanup", "success", start.elapsed().as_secs_f64());
    evicted
}

/// Reload a full-pull source, returning the delay until the next reload
pub async fn refresh_resolver(resolver: &MetadataResolver) -> MetadataResult<Option<Duration>> {
    let start = Instant::now();
    let result = resolver.refresh().await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_background_job("metadata_refresh", status, start.elapsed().as_secs_f64());
    result
}

/// Sweep expired artifacts
pub async fn sweep_artifacts(artifacts: &dyn ArtifactMap) -> MetadataResult<usize> {
    let start = Instant::now();
    let result = artifacts.sweep().await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_background_job("artifact_sweep", status, start.elapsed().as_secs_f64());
    result
}
