/// Filesystem-backed persistent cache
use super::PersistentCacheManager;
use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::PathBuf;
use tokio::fs;

const TEMP_PREFIX: &str = ".tmp-";

/// One JSON file per key under a base directory
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// never leaves a half-written entry under a real key.
pub struct FilesystemCacheManager<T> {
    base_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FilesystemCacheManager<T> {
    /// Create the manager, creating the directory if needed
    pub async fn new(base_path: impl Into<PathBuf>) -> MetadataResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            MetadataError::Configuration(format!(
                "Failed to create cache directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        Ok(Self {
            base_path,
            _marker: PhantomData,
        })
    }

    /// Keys become file names, so restrict them to a safe alphabet
    fn key_path(&self, key: &str) -> MetadataResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(MetadataError::InvalidArgument(format!(
                "Invalid persistent cache key: {:?}",
                key
            )));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl<T> PersistentCacheManager<T> for FilesystemCacheManager<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list_keys(&self) -> MetadataResult<HashSet<String>> {
        let mut keys = HashSet::new();
        let mut dir = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(TEMP_PREFIX) {
                    keys.insert(name.to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> MetadataResult<bool> {
        Ok(fs::try_exists(self.key_path(key)?).await?)
    }

    async fn load(&self, key: &str) -> MetadataResult<Option<T>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &T, overwrite: bool) -> MetadataResult<()> {
        let path = self.key_path(key)?;
        if !overwrite && fs::try_exists(&path).await? {
            return Err(MetadataError::AlreadyExists(key.to_string()));
        }

        let data = serde_json::to_vec(value)?;
        let temp = self
            .base_path
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        fs::write(&temp, data).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> MetadataResult<bool> {
        match fs::remove_file(self.key_path(key)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename_key(&self, old_key: &str, new_key: &str) -> MetadataResult<bool> {
        let old_path = self.key_path(old_key)?;
        let new_path = self.key_path(new_key)?;
        if !fs::try_exists(&old_path).await? {
            return Ok(false);
        }
        if fs::try_exists(&new_path).await? {
            return Err(MetadataError::AlreadyExists(new_key.to_string()));
        }
        fs::rename(&old_path, &new_path).await?;
        Ok(true)
    }
}
