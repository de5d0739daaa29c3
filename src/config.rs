/// Configuration management for the metadata resolver daemon
use crate::{
    error::{MetadataError, MetadataResult},
    fetch::{RefreshDelays, TemplateEncoding, ENTITY_ID_PLACEHOLDER},
    jobs::JobIntervals,
    metadata::RoleType,
    store::{RefreshFailurePolicy, ResolverConfig},
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub source: SourceConfig,
    pub resolver: ResolverSettings,
    pub persistence: PersistenceConfig,
    pub filters: FilterConfig,
    pub artifacts: ArtifactConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
}

/// Where metadata comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Local metadata document loaded once
    Static { file: PathBuf },
    /// Whole document pulled over HTTP and refreshed on a schedule
    Http {
        url: String,
        min_refresh_delay_secs: u64,
        max_refresh_delay_secs: u64,
        refresh_delay_factor: f64,
    },
    /// One request per query
    Dynamic {
        mdq_base_url: Option<String>,
        url_template: Option<String>,
        template_encoding: String,
        entity_id_as_url: bool,
        strict_http: bool,
    },
}

/// Resolver cache behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSettings {
    pub id: String,
    pub min_cache_duration_secs: u64,
    pub max_cache_duration_secs: u64,
    /// 0 disables negative caching
    pub negative_lookup_cache_secs: u64,
    /// `retain` or `evict`
    pub refresh_failure_policy: String,
    pub failure_retry_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// 0 disables idle eviction
    pub max_idle_secs: u64,
    pub single_flight: bool,
    pub secondary_lookup: bool,
    pub request_timeout_secs: u64,
}

/// Persistent cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub backend: PersistenceBackend,
    pub init_from_cache: bool,
    pub background_init: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PersistenceBackend {
    Filesystem { directory: PathBuf },
    Sqlite { path: PathBuf },
}

/// Filter pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub require_valid_until: bool,
    /// 0 means no upper bound
    pub max_validity_interval_secs: u64,
    /// `(name, hex SEC1 public key)` pairs
    pub trust_keys: Vec<(String, String)>,
    pub require_signed_root: bool,
    pub schema_validation: bool,
    /// Empty keeps every role
    pub retained_roles: Vec<String>,
}

/// Artifact map configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub lifetime_secs: u64,
    pub sweep_interval_secs: u64,
    pub backend: ArtifactBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArtifactBackend {
    Memory,
    Redis { url: String, key_prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 8480,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            source: SourceConfig::Static {
                file: PathBuf::from("./metadata.json"),
            },
            resolver: ResolverSettings {
                id: "default".to_string(),
                min_cache_duration_secs: 600,
                max_cache_duration_secs: 28800,
                negative_lookup_cache_secs: 600,
                refresh_failure_policy: "retain".to_string(),
                failure_retry_interval_secs: 600,
                cleanup_interval_secs: 1800,
                max_idle_secs: 28800,
                single_flight: true,
                secondary_lookup: true,
                request_timeout_secs: 30,
            },
            persistence: PersistenceConfig {
                enabled: false,
                backend: PersistenceBackend::Filesystem {
                    directory: PathBuf::from("./data/metadata-cache"),
                },
                init_from_cache: true,
                background_init: false,
            },
            filters: FilterConfig {
                require_valid_until: false,
                max_validity_interval_secs: 0,
                trust_keys: Vec::new(),
                require_signed_root: false,
                schema_validation: true,
                retained_roles: Vec::new(),
            },
            artifacts: ArtifactConfig {
                lifetime_secs: 240,
                sweep_interval_secs: 300,
                backend: ArtifactBackend::Memory,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

/// Read and parse an optional variable, erroring on unparseable values
fn env_parse<T: FromStr>(key: &str, default: T) -> MetadataResult<T> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().parse().map_err(|_| {
            MetadataError::Configuration(format!("Invalid value for {}: {}", key, value))
        }),
        _ => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> MetadataResult<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let hostname = env::var("METADATA_HOSTNAME").unwrap_or(defaults.service.hostname);
        let port = env_parse("METADATA_PORT", defaults.service.port)?;
        let version = env::var("METADATA_VERSION").unwrap_or(defaults.service.version);

        let source_type = env::var("METADATA_SOURCE_TYPE").unwrap_or_else(|_| "static".to_string());
        let source = match source_type.trim().to_ascii_lowercase().as_str() {
            "static" => SourceConfig::Static {
                file: env::var("METADATA_SOURCE_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./metadata.json")),
            },
            "http" => {
                let delays = RefreshDelays::default();
                SourceConfig::Http {
                    url: env::var("METADATA_SOURCE_URL").map_err(|_| {
                        MetadataError::Configuration(
                            "METADATA_SOURCE_URL required for http source".to_string(),
                        )
                    })?,
                    min_refresh_delay_secs: env_parse(
                        "METADATA_MIN_REFRESH_DELAY",
                        delays.min.as_secs(),
                    )?,
                    max_refresh_delay_secs: env_parse(
                        "METADATA_MAX_REFRESH_DELAY",
                        delays.max.as_secs(),
                    )?,
                    refresh_delay_factor: env_parse(
                        "METADATA_REFRESH_DELAY_FACTOR",
                        delays.factor,
                    )?,
                }
            }
            "dynamic" => SourceConfig::Dynamic {
                mdq_base_url: env::var("METADATA_MDQ_BASE_URL").ok(),
                url_template: env::var("METADATA_DYNAMIC_URL_TEMPLATE").ok(),
                template_encoding: env::var("METADATA_DYNAMIC_TEMPLATE_ENCODING")
                    .unwrap_or_else(|_| "form".to_string()),
                entity_id_as_url: env_parse("METADATA_DYNAMIC_ENTITY_ID_AS_URL", false)?,
                strict_http: env_parse("METADATA_DYNAMIC_STRICT_HTTP", false)?,
            },
            other => {
                return Err(MetadataError::Configuration(format!(
                    "Unknown METADATA_SOURCE_TYPE: {}",
                    other
                )))
            }
        };

        let r = defaults.resolver;
        let resolver = ResolverSettings {
            id: env::var("METADATA_RESOLVER_ID").unwrap_or(r.id),
            min_cache_duration_secs: env_parse(
                "METADATA_MIN_CACHE_DURATION",
                r.min_cache_duration_secs,
            )?,
            max_cache_duration_secs: env_parse(
                "METADATA_MAX_CACHE_DURATION",
                r.max_cache_duration_secs,
            )?,
            negative_lookup_cache_secs: env_parse(
                "METADATA_NEGATIVE_LOOKUP_CACHE_DURATION",
                r.negative_lookup_cache_secs,
            )?,
            refresh_failure_policy: env::var("METADATA_REFRESH_FAILURE_POLICY")
                .unwrap_or(r.refresh_failure_policy),
            failure_retry_interval_secs: env_parse(
                "METADATA_FAILURE_RETRY_INTERVAL",
                r.failure_retry_interval_secs,
            )?,
            cleanup_interval_secs: env_parse("METADATA_CLEANUP_INTERVAL", r.cleanup_interval_secs)?,
            max_idle_secs: env_parse("METADATA_MAX_IDLE", r.max_idle_secs)?,
            single_flight: env_parse("METADATA_SINGLE_FLIGHT", r.single_flight)?,
            secondary_lookup: env_parse("METADATA_SECONDARY_LOOKUP", r.secondary_lookup)?,
            request_timeout_secs: env_parse("METADATA_REQUEST_TIMEOUT", r.request_timeout_secs)?,
        };

        let persistence_backend = match env::var("METADATA_PERSISTENCE_BACKEND")
            .unwrap_or_else(|_| "filesystem".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "filesystem" => PersistenceBackend::Filesystem {
                directory: env::var("METADATA_PERSISTENCE_DIRECTORY")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/metadata-cache")),
            },
            "sqlite" => PersistenceBackend::Sqlite {
                path: env::var("METADATA_PERSISTENCE_SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/metadata-cache.sqlite")),
            },
            other => {
                return Err(MetadataError::Configuration(format!(
                    "Unknown METADATA_PERSISTENCE_BACKEND: {}",
                    other
                )))
            }
        };
        let persistence = PersistenceConfig {
            enabled: env_parse("METADATA_PERSISTENCE_ENABLED", false)?,
            backend: persistence_backend,
            init_from_cache: env_parse("METADATA_INIT_FROM_CACHE", true)?,
            background_init: env_parse("METADATA_BACKGROUND_INIT", false)?,
        };

        // Trust keys as comma-separated name=hex pairs
        let trust_keys = env_list("METADATA_TRUST_KEYS")
            .into_iter()
            .map(|pair| match pair.split_once('=') {
                Some((name, key)) => Ok((name.trim().to_string(), key.trim().to_string())),
                None => Err(MetadataError::Configuration(format!(
                    "Trust key must be name=hex: {}",
                    pair
                ))),
            })
            .collect::<MetadataResult<Vec<_>>>()?;

        let filters = FilterConfig {
            require_valid_until: env_parse("METADATA_REQUIRE_VALID_UNTIL", false)?,
            max_validity_interval_secs: env_parse("METADATA_MAX_VALIDITY_INTERVAL", 0)?,
            trust_keys,
            require_signed_root: env_parse("METADATA_REQUIRE_SIGNED_ROOT", false)?,
            schema_validation: env_parse("METADATA_SCHEMA_VALIDATION", true)?,
            retained_roles: env_list("METADATA_RETAINED_ROLES"),
        };

        let artifact_backend = match env::var("METADATA_ARTIFACT_REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => ArtifactBackend::Redis {
                url,
                key_prefix: env::var("METADATA_ARTIFACT_REDIS_PREFIX")
                    .unwrap_or_else(|_| "federation-metadata:".to_string()),
            },
            _ => ArtifactBackend::Memory,
        };
        let artifacts = ArtifactConfig {
            lifetime_secs: env_parse("METADATA_ARTIFACT_LIFETIME", defaults.artifacts.lifetime_secs)?,
            sweep_interval_secs: env_parse(
                "METADATA_ARTIFACT_SWEEP_INTERVAL",
                defaults.artifacts.sweep_interval_secs,
            )?,
            backend: artifact_backend,
        };

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
            },
            source,
            resolver,
            persistence,
            filters,
            artifacts,
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> MetadataResult<()> {
        if self.service.hostname.is_empty() {
            return Err(MetadataError::Configuration("Hostname cannot be empty".to_string()));
        }
        if self.resolver.id.trim().is_empty() {
            return Err(MetadataError::Configuration("Resolver id cannot be empty".to_string()));
        }
        if self.resolver.min_cache_duration_secs > self.resolver.max_cache_duration_secs {
            return Err(MetadataError::Configuration(
                "Minimum cache duration exceeds maximum".to_string(),
            ));
        }
        if self.resolver.request_timeout_secs == 0 {
            return Err(MetadataError::Configuration(
                "Request timeout must be positive".to_string(),
            ));
        }
        if self.resolver.cleanup_interval_secs == 0 {
            return Err(MetadataError::Configuration(
                "Cleanup interval must be positive".to_string(),
            ));
        }
        self.refresh_failure_policy()?;

        match &self.source {
            SourceConfig::Static { file } => {
                if file.as_os_str().is_empty() {
                    return Err(MetadataError::Configuration(
                        "Static source requires a file".to_string(),
                    ));
                }
            }
            SourceConfig::Http {
                url,
                min_refresh_delay_secs,
                max_refresh_delay_secs,
                refresh_delay_factor,
            } => {
                if url.trim().is_empty() {
                    return Err(MetadataError::Configuration(
                        "HTTP source requires a URL".to_string(),
                    ));
                }
                if min_refresh_delay_secs > max_refresh_delay_secs {
                    return Err(MetadataError::Configuration(
                        "Minimum refresh delay exceeds maximum".to_string(),
                    ));
                }
                if !(*refresh_delay_factor > 0.0 && *refresh_delay_factor <= 1.0) {
                    return Err(MetadataError::Configuration(
                        "Refresh delay factor must be in (0, 1]".to_string(),
                    ));
                }
            }
            SourceConfig::Dynamic {
                mdq_base_url,
                url_template,
                template_encoding,
                entity_id_as_url,
                ..
            } => {
                if mdq_base_url.is_none() && url_template.is_none() && !entity_id_as_url {
                    return Err(MetadataError::Configuration(
                        "Dynamic source requires an MDQ base URL, a URL template or entity-ID-as-URL"
                            .to_string(),
                    ));
                }
                if let Some(template) = url_template {
                    if !template.contains(ENTITY_ID_PLACEHOLDER) {
                        return Err(MetadataError::Configuration(format!(
                            "URL template must contain {}",
                            ENTITY_ID_PLACEHOLDER
                        )));
                    }
                }
                TemplateEncoding::from_str(template_encoding)
                    .map_err(MetadataError::Configuration)?;
            }
        }

        if self.filters.require_signed_root && self.filters.trust_keys.is_empty() {
            return Err(MetadataError::Configuration(
                "Signed metadata required but no trust keys configured".to_string(),
            ));
        }
        self.retained_roles()?;

        if self.artifacts.lifetime_secs == 0 || self.artifacts.sweep_interval_secs == 0 {
            return Err(MetadataError::Configuration(
                "Artifact lifetime and sweep interval must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn refresh_failure_policy(&self) -> MetadataResult<RefreshFailurePolicy> {
        match self.resolver.refresh_failure_policy.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(RefreshFailurePolicy::RetainAndExtend(seconds(
                self.resolver.failure_retry_interval_secs,
            ))),
            "evict" => Ok(RefreshFailurePolicy::Evict),
            other => Err(MetadataError::Configuration(format!(
                "Unknown refresh failure policy: {}",
                other
            ))),
        }
    }

    pub fn retained_roles(&self) -> MetadataResult<Vec<RoleType>> {
        self.filters
            .retained_roles
            .iter()
            .map(|r| RoleType::from_str(r).map_err(MetadataError::Configuration))
            .collect()
    }

    /// Resolver settings in the form the resolver consumes
    pub fn resolver_config(&self) -> MetadataResult<ResolverConfig> {
        let r = &self.resolver;
        Ok(ResolverConfig {
            min_cache_duration: seconds(r.min_cache_duration_secs),
            max_cache_duration: seconds(r.max_cache_duration_secs),
            negative_lookup_cache_duration: (r.negative_lookup_cache_secs > 0)
                .then(|| seconds(r.negative_lookup_cache_secs)),
            refresh_failure_policy: self.refresh_failure_policy()?,
            max_idle: (r.max_idle_secs > 0).then(|| seconds(r.max_idle_secs)),
            single_flight: r.single_flight,
            secondary_lookup: r.secondary_lookup,
        })
    }

    pub fn job_intervals(&self) -> JobIntervals {
        JobIntervals {
            resolver_cleanup: Duration::from_secs(self.resolver.cleanup_interval_secs),
            artifact_sweep: Duration::from_secs(self.artifacts.sweep_interval_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver.request_timeout_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();

        let resolver = config.resolver_config().unwrap();
        assert_eq!(resolver.min_cache_duration, chrono::Duration::minutes(10));
        assert_eq!(resolver.max_cache_duration, chrono::Duration::hours(8));
        assert!(matches!(
            resolver.refresh_failure_policy,
            RefreshFailurePolicy::RetainAndExtend(_)
        ));
    }

    #[test]
    fn test_zero_disables_optional_durations() {
        let mut config = ServerConfig::default();
        config.resolver.negative_lookup_cache_secs = 0;
        config.resolver.max_idle_secs = 0;
        config.resolver.refresh_failure_policy = "evict".to_string();

        let resolver = config.resolver_config().unwrap();
        assert!(resolver.negative_lookup_cache_duration.is_none());
        assert!(resolver.max_idle.is_none());
        assert_eq!(resolver.refresh_failure_policy, RefreshFailurePolicy::Evict);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = ServerConfig::default();
        config.resolver.min_cache_duration_secs = 10;
        config.resolver.max_cache_duration_secs = 5;
        assert!(matches!(config.validate(), Err(MetadataError::Configuration(_))));

        let mut config = ServerConfig::default();
        config.source = SourceConfig::Dynamic {
            mdq_base_url: None,
            url_template: Some("https://mdq.example.org/entities".to_string()),
            template_encoding: "form".to_string(),
            entity_id_as_url: false,
            strict_http: false,
        };
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.source = SourceConfig::Http {
            url: "https://md.example.org/federation.json".to_string(),
            min_refresh_delay_secs: 600,
            max_refresh_delay_secs: 60,
            refresh_delay_factor: 0.75,
        };
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.filters.require_signed_root = true;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.filters.retained_roles = vec!["idpSso".to_string(), "bogus".to_string()];
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.resolver.refresh_failure_policy = "sometimes".to_string();
        assert!(config.validate().is_err());
    }
}
