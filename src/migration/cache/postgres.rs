//! Postgres-backed mapping cache.
//!
//! Stores entries in the `migration_mappings` table created by the engine's
//! own migrations, so mappings survive process restarts without a cache file.

use super::{CacheBackend, CacheError, StoredEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct PgCacheBackend {
    pool: PgPool,
}

impl PgCacheBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheBackend for PgCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let row: Option<(i64, Option<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"SELECT target_id, tag, expires_at
               FROM migration_mappings
               WHERE cache_key = $1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(target_id, tag, expires_at)| StoredEntry {
            target_id,
            tag,
            expires_at,
        }))
    }

    async fn put(&self, key: String, entry: StoredEntry) -> Result<(), CacheError> {
        sqlx::query(
            r#"INSERT INTO migration_mappings (cache_key, target_id, tag, expires_at, updated_at)
               VALUES ($1, $2, $3, $4, NOW())
               ON CONFLICT (cache_key) DO UPDATE
               SET target_id = EXCLUDED.target_id,
                   tag = EXCLUDED.tag,
                   expires_at = EXCLUDED.expires_at,
                   updated_at = NOW()"#,
        )
        .bind(&key)
        .bind(entry.target_id)
        .bind(entry.tag)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn forget_many(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM migration_mappings WHERE cache_key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn flush_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let result = sqlx::query("DELETE FROM migration_mappings WHERE tag = $1")
            .bind(tag)
            .execute(&self.pool)
            .await?;

        log::debug!("flushed {} mappings tagged {}", result.rows_affected(), tag);
        Ok(result.rows_affected() as usize)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*)
               FROM migration_mappings
               WHERE starts_with(cache_key, $1)
                 AND (expires_at IS NULL OR expires_at > NOW())"#,
        )
        .bind(prefix)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }
}
