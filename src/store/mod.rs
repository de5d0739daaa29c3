/// Caching resolver: backing store, resolution algorithm and persistence

pub mod backing;
pub mod persistent;
pub mod resolver;

pub use backing::{BackingStore, CacheRecord};
pub use persistent::{
    default_key_generator, CacheKeyGenerator, DescriptorCache, FilesystemCacheManager,
    PersistentCacheManager, SqliteCacheManager,
};
pub use resolver::{
    MetadataResolver, Persistence, RefreshFailurePolicy, RefreshStatus, ResolverBuilder,
    ResolverConfig,
};
