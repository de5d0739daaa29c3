/// SQLite-backed persistent cache
use super::PersistentCacheManager;
use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::Path;

/// Rows of `persistent_cache(cache_key, value, updated_at)`
pub struct SqliteCacheManager<T> {
    db: SqlitePool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SqliteCacheManager<T> {
    /// Wrap an existing pool, creating the table if needed
    pub async fn new(db: SqlitePool) -> MetadataResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS persistent_cache (
                cache_key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        Ok(Self {
            db,
            _marker: PhantomData,
        })
    }

    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::new(db).await
    }
}

#[async_trait]
impl<T> PersistentCacheManager<T> for SqliteCacheManager<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list_keys(&self) -> MetadataResult<HashSet<String>> {
        let rows = sqlx::query("SELECT cache_key FROM persistent_cache")
            .fetch_all(&self.db)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("cache_key").map_err(MetadataError::from))
            .collect()
    }

    async fn exists(&self, key: &str) -> MetadataResult<bool> {
        let row = sqlx::query("SELECT 1 FROM persistent_cache WHERE cache_key = ?1")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.is_some())
    }

    async fn load(&self, key: &str) -> MetadataResult<Option<T>> {
        let row = sqlx::query("SELECT value FROM persistent_cache WHERE cache_key = ?1")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, value: &T, overwrite: bool) -> MetadataResult<()> {
        let value = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();

        if overwrite {
            sqlx::query(
                r#"
                INSERT INTO persistent_cache (cache_key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(cache_key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(&value)
            .bind(&now)
            .execute(&self.db)
            .await?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO persistent_cache (cache_key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(cache_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(&now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::AlreadyExists(key.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM persistent_cache WHERE cache_key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rename_key(&self, old_key: &str, new_key: &str) -> MetadataResult<bool> {
        let mut tx = self.db.begin().await?;

        let taken = sqlx::query("SELECT 1 FROM persistent_cache WHERE cache_key = ?1")
            .bind(new_key)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(MetadataError::AlreadyExists(new_key.to_string()));
        }

        let result = sqlx::query("UPDATE persistent_cache SET cache_key = ?1 WHERE cache_key = ?2")
            .bind(new_key)
            .bind(old_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::EntityDescriptor;

    async fn create_test_cache() -> SqliteCacheManager<EntityDescriptor> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteCacheManager::new(db).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let cache = create_test_cache().await;
        let ed = EntityDescriptor::new("https://idp.example.org").with_attribute("a", "b");

        cache.save("k1", &ed, false).await.unwrap();
        assert!(cache.exists("k1").await.unwrap());
        assert_eq!(cache.load("k1").await.unwrap(), Some(ed));
        assert_eq!(cache.load("k2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_collision() {
        let cache = create_test_cache().await;
        let ed = EntityDescriptor::new("https://idp.example.org");

        cache.save("k1", &ed, false).await.unwrap();
        assert!(matches!(
            cache.save("k1", &ed, false).await,
            Err(MetadataError::AlreadyExists(_))
        ));

        let updated = ed.clone().with_attribute("x", "y");
        cache.save("k1", &updated, true).await.unwrap();
        assert_eq!(cache.load("k1").await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let cache = create_test_cache().await;
        let ed = EntityDescriptor::new("https://idp.example.org");

        cache.save("a", &ed, false).await.unwrap();
        cache.save("b", &ed, false).await.unwrap();

        assert!(matches!(
            cache.rename_key("a", "b").await,
            Err(MetadataError::AlreadyExists(_))
        ));
        assert!(cache.rename_key("a", "c").await.unwrap());
        assert!(!cache.rename_key("missing", "d").await.unwrap());

        let keys = cache.list_keys().await.unwrap();
        assert!(keys.contains("b") && keys.contains("c") && !keys.contains("a"));

        assert!(cache.remove("b").await.unwrap());
        assert!(!cache.remove("b").await.unwrap());
    }
}
