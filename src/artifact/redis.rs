/// Redis storage service for artifacts
///
/// Records are written with `SET NX PX`, so Redis both refuses duplicates
/// and expires records natively.
use super::storage::StorageService;
use crate::{
    clock::Clock,
    error::{MetadataError, MetadataResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Milliseconds until `expiration`, at least one so `PX` stays valid
fn ttl_millis(expiration: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiration - now).num_milliseconds().max(1)
}

#[derive(Clone)]
pub struct RedisStorageService {
    connection: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl RedisStorageService {
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> MetadataResult<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = Client::open(redis_url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            MetadataError::Configuration(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            MetadataError::Storage(format!("Redis connection failed: {}", e))
        })?;

        info!("✓ Redis connection established");

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            clock,
        })
    }

    fn build_key(&self, context: &str, key: &str) -> String {
        format!("{}{}:{}", self.key_prefix, context, key)
    }

    /// Ping Redis to check connection
    pub async fn ping(&self) -> MetadataResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| MetadataError::Storage(format!("Redis PING failed: {}", e)))?;

        if pong != "PONG" {
            return Err(MetadataError::Storage(
                "Unexpected Redis PING response".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageService for RedisStorageService {
    async fn create(
        &self,
        context: &str,
        key: &str,
        value: &str,
        expiration: DateTime<Utc>,
    ) -> MetadataResult<bool> {
        let storage_key = self.build_key(context, key);
        let ttl_ms = ttl_millis(expiration, self.clock.now());

        debug!("Storage SET NX: {} (TTL: {}ms)", storage_key, ttl_ms);

        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&storage_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!("Redis SET failed for {}: {}", storage_key, e);
                MetadataError::Storage(format!("Storage create failed: {}", e))
            })?;

        Ok(reply.is_some())
    }

    async fn read(&self, context: &str, key: &str) -> MetadataResult<Option<String>> {
        let storage_key = self.build_key(context, key);

        let mut conn = self.connection.clone();
        conn.get(&storage_key).await.map_err(|e| {
            warn!("Redis GET failed for {}: {}", storage_key, e);
            MetadataError::Storage(format!("Storage read failed: {}", e))
        })
    }

    async fn delete(&self, context: &str, key: &str) -> MetadataResult<bool> {
        let storage_key = self.build_key(context, key);

        let mut conn = self.connection.clone();
        let deleted: u64 = conn.del(&storage_key).await.map_err(|e| {
            warn!("Redis DEL failed for {}: {}", storage_key, e);
            MetadataError::Storage(format!("Storage delete failed: {}", e))
        })?;
        Ok(deleted > 0)
    }
}
