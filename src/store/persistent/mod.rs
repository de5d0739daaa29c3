/// Durable key/value side-cache used to warm the backing store
///
/// Values are stored as JSON. Keys come from a `CacheKeyGenerator`, and the
/// resolver keeps stored keys consistent with the generator in use.

pub mod disk;
pub mod sqlite;

pub use disk::FilesystemCacheManager;
pub use sqlite::SqliteCacheManager;

use crate::{error::MetadataResult, metadata::EntityDescriptor};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Generic durable cache
#[async_trait]
pub trait PersistentCacheManager<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn list_keys(&self) -> MetadataResult<HashSet<String>>;

    async fn exists(&self, key: &str) -> MetadataResult<bool>;

    /// Load a value; corrupt entries fail with a serialization error
    async fn load(&self, key: &str) -> MetadataResult<Option<T>>;

    /// Store a value, failing with `AlreadyExists` when `overwrite` is false
    /// and the key is taken
    async fn save(&self, key: &str, value: &T, overwrite: bool) -> MetadataResult<()>;

    async fn remove(&self, key: &str) -> MetadataResult<bool>;

    /// Move a value to a new key; `false` if `old_key` does not exist,
    /// `AlreadyExists` if `new_key` is taken
    async fn rename_key(&self, old_key: &str, new_key: &str) -> MetadataResult<bool>;
}

/// Shared handle to the descriptor cache
pub type DescriptorCache = Arc<dyn PersistentCacheManager<EntityDescriptor>>;

/// Derives the persistent cache key for a descriptor
pub type CacheKeyGenerator = Arc<dyn Fn(&EntityDescriptor) -> String + Send + Sync>;

/// Hex SHA-256 of the entity ID
pub fn sha256_entity_id_key(descriptor: &EntityDescriptor) -> String {
    hex::encode(Sha256::digest(descriptor.entity_id.as_bytes()))
}

pub fn default_key_generator() -> CacheKeyGenerator {
    Arc::new(sha256_entity_id_key)
}
