//! Carrier reference data, seeded at migration and read-only through the core.

use sqlx::SqlitePool;

use crate::models::Carrier;
use crate::Result;

#[derive(Clone)]
pub struct CarrierRepository {
    pool: SqlitePool,
}

impl CarrierRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_active(&self) -> Result<Vec<Carrier>> {
        let carriers =
            sqlx::query_as::<_, Carrier>("SELECT * FROM carriers WHERE active = 1 ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(carriers)
    }

    pub async fn list_all(&self) -> Result<Vec<Carrier>> {
        let carriers = sqlx::query_as::<_, Carrier>("SELECT * FROM carriers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(carriers)
    }
}
