//! Database migration system
//!
//! Schema evolution is additive: migrations only create tables and add
//! nullable/defaulted columns, never drop. Applied versions are tracked in a
//! `_migrations` table so startup is idempotent.

use sqlx::{Row, SqlitePool};
use tracing::{error, info};

use crate::{Error, Result};

/// Migration record tracking applied migrations
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
}

/// Database migration manager
pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<Migration>> {
        let rows = sqlx::query(r#"SELECT version, name FROM _migrations ORDER BY version"#)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let migrations = rows
            .into_iter()
            .map(|row| Migration {
                version: row.get("version"),
                name: row.get("name"),
            })
            .collect();

        Ok(migrations)
    }

    async fn record_migration(&self, version: i64, name: &str) -> Result<()> {
        sqlx::query(r#"INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)"#)
            .bind(version)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    /// Run all pending migrations
    pub async fn migrate(&self) -> Result<()> {
        self.init_migration_table().await?;

        let applied = self.get_applied_migrations().await?;

        let migrations = vec![
            (1, "initial_schema", include_str!("../../migrations/001_initial_schema.sql")),
            (2, "refresh_bookkeeping", include_str!("../../migrations/002_refresh_bookkeeping.sql")),
            (3, "auto_refresh", include_str!("../../migrations/003_auto_refresh.sql")),
            (4, "amazon_delegation", include_str!("../../migrations/004_amazon_delegation.sql")),
            (5, "email_entities", include_str!("../../migrations/005_email_entities.sql")),
            (6, "email_body_retention", include_str!("../../migrations/006_email_body_retention.sql")),
        ];

        for (version, name, sql) in migrations {
            if applied.iter().any(|m| m.version == version) {
                continue;
            }

            info!("Applying migration {} ({})...", version, name);

            sqlx::raw_sql(sql).execute(&self.pool).await.map_err(|e| {
                error!("Failed to execute migration {}: {}", version, e);
                Error::Database(e)
            })?;

            self.record_migration(version, name).await?;
        }

        info!("Migrations up to date");
        Ok(())
    }

    /// Applied-migration count, used by the health command
    pub async fn applied_count(&self) -> Result<usize> {
        self.init_migration_table().await?;
        Ok(self.get_applied_migrations().await?.len())
    }
}

/// Run migrations automatically on startup
pub async fn auto_migrate(pool: &SqlitePool) -> Result<()> {
    let migrator = Migrator::new(pool.clone());
    migrator.migrate().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = create_memory_pool().await.unwrap();
        let migrator = Migrator::new(pool.clone());

        migrator.migrate().await.unwrap();
        let first = migrator.applied_count().await.unwrap();

        // Second run must be a no-op, not a failure on duplicate ALTERs
        migrator.migrate().await.unwrap();
        assert_eq!(migrator.applied_count().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_carriers_are_seeded() {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) AS n FROM carriers")
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 5);

        let dhl = sqlx::query("SELECT active FROM carriers WHERE code = 'dhl'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let active: bool = dhl.get("active");
        assert!(!active, "DHL seeds inactive");
    }
}
