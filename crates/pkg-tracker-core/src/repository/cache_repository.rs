//! Persistence for refresh-cache entries. Entries survive restarts; the
//! evictor task sweeps expired rows and shipment deletes cascade eagerly.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::RefreshCacheEntry;
use crate::Result;

#[derive(Clone)]
pub struct RefreshCacheRepository {
    pool: SqlitePool,
}

impl RefreshCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The live entry for a shipment, if any (expired entries are not
    /// filtered here; callers compare against their own now).
    pub async fn get(&self, shipment_id: i64) -> Result<Option<RefreshCacheEntry>> {
        let entry = sqlx::query_as::<_, RefreshCacheEntry>(
            "SELECT * FROM refresh_cache WHERE shipment_id = ?1",
        )
        .bind(shipment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Create or overwrite the entry for a shipment.
    pub async fn put(
        &self,
        shipment_id: i64,
        response: &str,
        cached_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_cache (shipment_id, response, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (shipment_id) DO UPDATE SET
                response = excluded.response,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(shipment_id)
        .bind(response)
        .bind(cached_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, shipment_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM refresh_cache WHERE shipment_id = ?1")
            .bind(shipment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove all entries past their expiry; returns the count removed.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_cache WHERE expires_at < ?1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
