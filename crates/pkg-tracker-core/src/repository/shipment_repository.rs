//! Shipment persistence: creation, listing, refresh bookkeeping, and the
//! updater's eligibility query.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{CarrierCode, CreateShipmentRequest, DashboardStats, Shipment};
use crate::{Error, Result};

/// Truncation bound for persisted carrier error text
const MAX_ERROR_LEN: usize = 500;

/// Outcome of one auto-refresh attempt, as accounted by the store
#[derive(Debug, Clone)]
pub enum AutoRefreshOutcome {
    Success,
    Error(String),
}

#[derive(Clone)]
pub struct ShipmentRepository {
    pool: SqlitePool,
}

impl ShipmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a shipment. Duplicate tracking numbers yield `Error::Duplicate`.
    pub async fn create(&self, request: &CreateShipmentRequest) -> Result<Shipment> {
        let carrier: CarrierCode = request
            .carrier
            .parse()
            .map_err(|e: String| Error::Validation(e))?;

        let tracking_number = request.tracking_number.trim();
        if tracking_number.is_empty() {
            return Err(Error::validation("tracking_number must not be empty"));
        }

        if carrier == CarrierCode::Amazon {
            let has_order = request
                .amazon_order_number
                .as_deref()
                .is_some_and(|s| !s.is_empty());
            let has_delegated = request
                .delegated_tracking_number
                .as_deref()
                .is_some_and(|s| !s.is_empty());
            if !has_order && !has_delegated {
                return Err(Error::validation(
                    "amazon shipments need an order number or a delegated tracking number",
                ));
            }
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO shipments (
                tracking_number, carrier, description, status, is_delivered,
                created_at, updated_at,
                amazon_order_number, delegated_carrier, delegated_tracking_number,
                is_amazon_logistics
            )
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(tracking_number)
        .bind(carrier)
        .bind(request.description.trim())
        .bind(now)
        .bind(&request.amazon_order_number)
        .bind(&request.delegated_carrier)
        .bind(&request.delegated_tracking_number)
        .bind(request.is_amazon_logistics)
        .execute(&self.pool)
        .await;

        let inserted = match result {
            Ok(r) => r,
            Err(e) => {
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false)
                {
                    return Err(Error::duplicate(format!(
                        "a shipment with tracking number {} already exists",
                        tracking_number
                    )));
                }
                return Err(Error::Database(e));
            }
        };

        self.get(inserted.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<Shipment> {
        sqlx::query_as::<_, Shipment>("SELECT * FROM shipments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("shipment {}", id)))
    }

    pub async fn get_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        let shipment =
            sqlx::query_as::<_, Shipment>("SELECT * FROM shipments WHERE tracking_number = ?1")
                .bind(tracking_number)
                .fetch_optional(&self.pool)
                .await?;
        Ok(shipment)
    }

    pub async fn list(&self) -> Result<Vec<Shipment>> {
        let shipments =
            sqlx::query_as::<_, Shipment>("SELECT * FROM shipments ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(shipments)
    }

    pub async fn update_description(&self, id: i64, description: &str) -> Result<Shipment> {
        let result = sqlx::query(
            "UPDATE shipments SET description = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(description.trim())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("shipment {}", id)));
        }
        self.get(id).await
    }

    /// Delete a shipment; events and the cache entry cascade away.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM shipments WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("shipment {}", id)));
        }
        Ok(())
    }

    /// The updater's eligibility query: undelivered, auto-refresh enabled,
    /// under the failure threshold, and created after the cutoff.
    pub async fn get_active_for_auto_update(
        &self,
        carrier: CarrierCode,
        cutoff: DateTime<Utc>,
        failure_threshold: i64,
    ) -> Result<Vec<Shipment>> {
        let shipments = sqlx::query_as::<_, Shipment>(
            r#"
            SELECT * FROM shipments
            WHERE carrier = ?1
              AND is_delivered = 0
              AND auto_refresh_enabled = 1
              AND consecutive_failure_count < ?2
              AND created_at > ?3
            ORDER BY id
            "#,
        )
        .bind(carrier)
        .bind(failure_threshold)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(shipments)
    }

    /// Atomic auto-refresh bookkeeping write.
    pub async fn update_auto_refresh(&self, id: i64, outcome: &AutoRefreshOutcome) -> Result<()> {
        match outcome {
            AutoRefreshOutcome::Success => {
                sqlx::query(
                    r#"
                    UPDATE shipments
                    SET last_error = NULL,
                        last_auto_refresh = ?1,
                        auto_refresh_count = auto_refresh_count + 1,
                        consecutive_failure_count = 0
                    WHERE id = ?2
                    "#,
                )
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            AutoRefreshOutcome::Error(message) => {
                let truncated: String = message.chars().take(MAX_ERROR_LEN).collect();
                sqlx::query(
                    r#"
                    UPDATE shipments
                    SET last_error = ?1,
                        consecutive_failure_count = consecutive_failure_count + 1
                    WHERE id = ?2
                    "#,
                )
                .bind(truncated)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Manual-refresh bookkeeping write.
    pub async fn record_manual_refresh(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE shipments
            SET last_manual_refresh = ?1,
                manual_refresh_count = manual_refresh_count + 1
            WHERE id = ?2
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN is_delivered = 0
                          AND status IN ('in_transit', 'out_for_delivery')
                    THEN 1 ELSE 0 END) AS in_transit,
                SUM(CASE WHEN is_delivered = 1 THEN 1 ELSE 0 END) AS delivered,
                SUM(CASE WHEN is_delivered = 0
                          AND (consecutive_failure_count > 0
                               OR status IN ('exception', 'returned'))
                    THEN 1 ELSE 0 END) AS needs_attention
            FROM shipments
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DashboardStats {
            total_shipments: row.get::<i64, _>("total"),
            in_transit: row.get::<Option<i64>, _>("in_transit").unwrap_or(0),
            delivered: row.get::<Option<i64>, _>("delivered").unwrap_or(0),
            needs_attention: row.get::<Option<i64>, _>("needs_attention").unwrap_or(0),
        })
    }

    /// Cheap store probe for the health endpoint
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, migrate::auto_migrate};

    async fn repo() -> ShipmentRepository {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();
        ShipmentRepository::new(pool)
    }

    fn ups_request(tracking: &str) -> CreateShipmentRequest {
        CreateShipmentRequest {
            tracking_number: tracking.to_string(),
            carrier: "ups".to_string(),
            description: "book".to_string(),
            amazon_order_number: None,
            delegated_carrier: None,
            delegated_tracking_number: None,
            is_amazon_logistics: false,
        }
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let repo = repo().await;
        let shipment = repo.create(&ups_request("1Z999AA10123456784")).await.unwrap();
        assert_eq!(shipment.status, "pending");
        assert!(!shipment.is_delivered);
        assert!(shipment.auto_refresh_enabled);
        assert_eq!(shipment.consecutive_failure_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_tracking_number_rejected() {
        let repo = repo().await;
        repo.create(&ups_request("1Z999AA10123456784")).await.unwrap();
        let err = repo.create(&ups_request("1Z999AA10123456784")).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_amazon_requires_order_or_delegation() {
        let repo = repo().await;
        let mut request = ups_request("AMZN-ONLY");
        request.carrier = "amazon".to_string();
        assert!(matches!(
            repo.create(&request).await.unwrap_err(),
            Error::Validation(_)
        ));

        request.amazon_order_number = Some("113-1234567-1234567".to_string());
        assert!(repo.create(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_eligibility_failure_threshold_boundary() {
        let repo = repo().await;
        let shipment = repo.create(&ups_request("1Z999AA10123456784")).await.unwrap();

        // threshold - 1 failures: still eligible
        for _ in 0..9 {
            repo.update_auto_refresh(shipment.id, &AutoRefreshOutcome::Error("boom".into()))
                .await
                .unwrap();
        }
        let cutoff = Utc::now() - chrono::Duration::days(30);
        let eligible = repo
            .get_active_for_auto_update(CarrierCode::Ups, cutoff, 10)
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);

        // exactly threshold: gone
        repo.update_auto_refresh(shipment.id, &AutoRefreshOutcome::Error("boom".into()))
            .await
            .unwrap();
        let eligible = repo
            .get_active_for_auto_update(CarrierCode::Ups, cutoff, 10)
            .await
            .unwrap();
        assert!(eligible.is_empty());

        // one success resets the count and restores eligibility
        repo.update_auto_refresh(shipment.id, &AutoRefreshOutcome::Success)
            .await
            .unwrap();
        let refreshed = repo.get(shipment.id).await.unwrap();
        assert_eq!(refreshed.consecutive_failure_count, 0);
        assert!(refreshed.last_error.is_none());
        assert_eq!(refreshed.auto_refresh_count, 1);
    }

    #[tokio::test]
    async fn test_error_text_truncated() {
        let repo = repo().await;
        let shipment = repo.create(&ups_request("1Z999AA10123456784")).await.unwrap();
        let long = "x".repeat(2000);
        repo.update_auto_refresh(shipment.id, &AutoRefreshOutcome::Error(long))
            .await
            .unwrap();
        let stored = repo.get(shipment.id).await.unwrap();
        assert_eq!(stored.last_error.unwrap().len(), MAX_ERROR_LEN);
    }

    #[tokio::test]
    async fn test_manual_refresh_bookkeeping() {
        let repo = repo().await;
        let shipment = repo.create(&ups_request("1Z999AA10123456784")).await.unwrap();
        repo.record_manual_refresh(shipment.id).await.unwrap();
        let stored = repo.get(shipment.id).await.unwrap();
        assert_eq!(stored.manual_refresh_count, 1);
        assert!(stored.last_manual_refresh.is_some());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let repo = repo().await;
        assert!(matches!(repo.delete(42).await.unwrap_err(), Error::NotFound(_)));
    }
}
