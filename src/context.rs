/// Application context and dependency injection
use crate::{
    artifact::{ArtifactMap, InMemoryArtifactMap, RedisStorageService, StorageArtifactMap},
    clock,
    config::{ArtifactBackend, PersistenceBackend, ServerConfig, SourceConfig},
    error::{MetadataError, MetadataResult},
    fetch::{
        DynamicHttpSource, EntityIdAsUrl, HttpDocumentSource, MdqUrlBuilder, OriginFetcher,
        RefreshDelays, StaticDocumentSource, TemplateEncoding, TemplateUrlBuilder, UrlBuilder,
    },
    filter::{
        EntityRoleFilter, FilterChain, K256TrustEngine, MetadataFilter, RequiredValidUntilFilter,
        SchemaValidationFilter, SignatureValidationFilter,
    },
    metadata::EntityDescriptor,
    store::{
        FilesystemCacheManager, MetadataResolver, Persistence, PersistentCacheManager,
        SqliteCacheManager,
    },
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub resolver: Arc<MetadataResolver>,
    pub artifacts: Arc<dyn ArtifactMap>,
    pub started_at: Instant,
}

impl AppContext {
    /// Create a new application context from configuration
    ///
    /// The resolver is built but not initialized.
    pub async fn new(config: ServerConfig) -> MetadataResult<Self> {
        // Validate configuration
        config.validate()?;

        let filters = Self::build_filters(&config, true)?;
        // Persisted copies no longer carry their wire form, so signatures cannot be re-checked
        let warm_start_filters = Self::build_filters(&config, false)?;
        let fetcher = Self::build_fetcher(&config).await?;

        let mut builder = MetadataResolver::builder(config.resolver.id.clone(), fetcher)
            .filters(filters)
            .warm_start_filters(warm_start_filters)
            .config(config.resolver_config()?);

        if config.persistence.enabled {
            let manager: Arc<dyn PersistentCacheManager<EntityDescriptor>> =
                match &config.persistence.backend {
                    PersistenceBackend::Filesystem { directory } => {
                        info!("Persistent metadata cache at {:?}", directory);
                        Arc::new(FilesystemCacheManager::new(directory.clone()).await?)
                    }
                    PersistenceBackend::Sqlite { path } => {
                        info!("Persistent metadata cache in {:?}", path);
                        Arc::new(SqliteCacheManager::open(path).await?)
                    }
                };
            builder = builder.persistence(
                Persistence::new(manager)
                    .init_from_cache(config.persistence.init_from_cache)
                    .background_init(config.persistence.background_init),
            );
        }
        let resolver = builder.build()?;

        let lifetime = chrono::Duration::seconds(
            i64::try_from(config.artifacts.lifetime_secs).unwrap_or(i64::MAX / 1000),
        );
        let artifacts: Arc<dyn ArtifactMap> = match &config.artifacts.backend {
            ArtifactBackend::Memory => {
                info!("Artifact map: in-memory");
                Arc::new(InMemoryArtifactMap::new(lifetime, clock::system()))
            }
            ArtifactBackend::Redis { url, key_prefix } => {
                let storage =
                    RedisStorageService::connect(url, key_prefix.clone(), clock::system()).await?;
                info!("Artifact map: redis");
                Arc::new(StorageArtifactMap::new(
                    Arc::new(storage),
                    lifetime,
                    clock::system(),
                ))
            }
        };

        Ok(Self::from_parts(config, resolver, artifacts))
    }

    /// Assemble a context from already-built components
    pub fn from_parts(
        config: ServerConfig,
        resolver: Arc<MetadataResolver>,
        artifacts: Arc<dyn ArtifactMap>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            artifacts,
            started_at: Instant::now(),
        }
    }

    fn build_filters(config: &ServerConfig, with_signatures: bool) -> MetadataResult<FilterChain> {
        let f = &config.filters;
        let mut filters: Vec<Arc<dyn MetadataFilter>> = Vec::new();

        if f.require_valid_until {
            let max = (f.max_validity_interval_secs > 0).then(|| {
                chrono::Duration::seconds(
                    i64::try_from(f.max_validity_interval_secs).unwrap_or(i64::MAX / 1000),
                )
            });
            filters.push(Arc::new(RequiredValidUntilFilter::new(max)));
        }
        if with_signatures && (!f.trust_keys.is_empty() || f.require_signed_root) {
            let engine = K256TrustEngine::from_hex_keys(
                f.trust_keys.iter().map(|(name, key)| (name.clone(), key.as_str())),
            )?;
            filters.push(Arc::new(SignatureValidationFilter::new(
                Arc::new(engine),
                f.require_signed_root,
            )));
        }
        if f.schema_validation {
            filters.push(Arc::new(SchemaValidationFilter));
        }
        let roles = config.retained_roles()?;
        if !roles.is_empty() {
            filters.push(Arc::new(EntityRoleFilter::new(roles)));
        }

        Ok(FilterChain::new(filters))
    }

    async fn build_fetcher(config: &ServerConfig) -> MetadataResult<Arc<dyn OriginFetcher>> {
        let timeout = config.request_timeout();
        let fetcher: Arc<dyn OriginFetcher> = match &config.source {
            SourceConfig::Static { file } => {
                info!("Metadata source: static file {:?}", file);
                Arc::new(StaticDocumentSource::from_file("static", file).await?)
            }
            SourceConfig::Http {
                url,
                min_refresh_delay_secs,
                max_refresh_delay_secs,
                refresh_delay_factor,
            } => {
                info!("Metadata source: {}", url);
                let delays = RefreshDelays {
                    min: Duration::from_secs(*min_refresh_delay_secs),
                    max: Duration::from_secs(*max_refresh_delay_secs),
                    factor: *refresh_delay_factor,
                };
                Arc::new(HttpDocumentSource::new("http", url.clone(), delays, timeout)?)
            }
            SourceConfig::Dynamic {
                mdq_base_url,
                url_template,
                template_encoding,
                entity_id_as_url,
                strict_http,
            } => {
                let builder: Arc<dyn UrlBuilder> = if let Some(base) = mdq_base_url {
                    info!("Metadata source: MDQ at {}", base);
                    Arc::new(MdqUrlBuilder::new(base.clone()))
                } else if let Some(template) = url_template {
                    info!("Metadata source: template {}", template);
                    let encoding = TemplateEncoding::from_str(template_encoding)
                        .map_err(MetadataError::Configuration)?;
                    Arc::new(TemplateUrlBuilder::new(template.clone(), encoding))
                } else if *entity_id_as_url {
                    info!("Metadata source: entity IDs as URLs");
                    Arc::new(EntityIdAsUrl)
                } else {
                    return Err(MetadataError::Configuration(
                        "Dynamic source has no URL strategy".to_string(),
                    ));
                };
                Arc::new(DynamicHttpSource::new("dynamic", builder, timeout)?.strict(*strict_http))
            }
        };
        Ok(fetcher)
    }

    /// Load data and become ready to serve
    pub async fn initialize(&self) -> MetadataResult<()> {
        self.resolver.initialize().await
    }

    /// Stop the resolver and release cached data
    pub fn shutdown(&self) {
        self.resolver.destroy();
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
