//! Tracking-event persistence with idempotent merge.

use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

use crate::carriers::TrackingActivity;
use crate::models::{TrackingEvent, TrackingStatus};
use crate::Result;

#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge carrier events into a shipment inside one transaction.
    ///
    /// Inserts are idempotent on `(shipment_id, occurred_at, description)`.
    /// Returns the count of newly inserted rows. `is_delivered` is recomputed
    /// from the full event set; `updated_at` moves only when rows landed.
    pub async fn merge_events(
        &self,
        shipment_id: i64,
        events: &[TrackingActivity],
        summary_status: TrackingStatus,
        expected_delivery: Option<NaiveDate>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut inserted: i64 = 0;
        for event in events {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO tracking_events
                    (shipment_id, occurred_at, location, status, description, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(shipment_id)
            .bind(event.occurred_at)
            .bind(&event.location)
            .bind(event.status.as_str())
            .bind(&event.description)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as i64;
        }

        // Newest event wins the summary status; the carrier's own summary is
        // the fallback when no events came back.
        let latest_status = events
            .first()
            .map(|e| e.status)
            .unwrap_or(summary_status);

        let has_delivered_event = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM tracking_events WHERE shipment_id = ?1 AND status = 'delivered') AS present",
        )
        .bind(shipment_id)
        .fetch_one(&mut *tx)
        .await?
        .get::<bool, _>("present");

        let is_delivered = has_delivered_event || latest_status.is_delivered();

        if inserted > 0 {
            sqlx::query(
                r#"
                UPDATE shipments
                SET status = ?1,
                    is_delivered = ?2,
                    expected_delivery = COALESCE(?3, expected_delivery),
                    updated_at = ?4
                WHERE id = ?5
                "#,
            )
            .bind(latest_status.as_str())
            .bind(is_delivered)
            .bind(expected_delivery)
            .bind(now)
            .bind(shipment_id)
            .execute(&mut *tx)
            .await?;
        } else {
            // No new rows: the delivered flag may still need to catch up, but
            // updated_at stays put.
            sqlx::query("UPDATE shipments SET is_delivered = ?1 WHERE id = ?2")
                .bind(is_delivered)
                .bind(shipment_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Events for a shipment, newest first, stable id order within a timestamp
    pub async fn list_for_shipment(&self, shipment_id: i64) -> Result<Vec<TrackingEvent>> {
        let events = sqlx::query_as::<_, TrackingEvent>(
            "SELECT * FROM tracking_events WHERE shipment_id = ?1 ORDER BY occurred_at DESC, id ASC",
        )
        .bind(shipment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn count_for_shipment(&self, shipment_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tracking_events WHERE shipment_id = ?1")
            .bind(shipment_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, migrate::auto_migrate};
    use crate::models::CreateShipmentRequest;
    use crate::repository::ShipmentRepository;
    use chrono::{Duration, Utc};

    async fn setup() -> (ShipmentRepository, EventRepository, i64) {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();
        let shipments = ShipmentRepository::new(pool.clone());
        let events = EventRepository::new(pool);
        let shipment = shipments
            .create(&CreateShipmentRequest {
                tracking_number: "1Z999AA10123456784".into(),
                carrier: "ups".into(),
                description: "book".into(),
                amazon_order_number: None,
                delegated_carrier: None,
                delegated_tracking_number: None,
                is_amazon_logistics: false,
            })
            .await
            .unwrap();
        (shipments, events, shipment.id)
    }

    fn activity(offset_hours: i64, status: TrackingStatus, description: &str) -> TrackingActivity {
        TrackingActivity {
            occurred_at: Utc::now() - Duration::hours(offset_hours),
            location: Some("Louisville, KY".into()),
            status,
            description: description.into(),
        }
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let (_, events, id) = setup().await;
        let batch = vec![
            activity(1, TrackingStatus::InTransit, "Departed facility"),
            activity(5, TrackingStatus::InTransit, "Origin scan"),
        ];

        assert_eq!(events.merge_events(id, &batch, TrackingStatus::InTransit, None).await.unwrap(), 2);
        // Merging the identical batch again inserts nothing
        assert_eq!(events.merge_events(id, &batch, TrackingStatus::InTransit, None).await.unwrap(), 0);
        assert_eq!(events.count_for_shipment(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_merge_sets_delivered_and_status() {
        let (shipments, events, id) = setup().await;
        let batch = vec![
            activity(0, TrackingStatus::Delivered, "Delivered"),
            activity(4, TrackingStatus::OutForDelivery, "Out for delivery"),
        ];
        events.merge_events(id, &batch, TrackingStatus::Delivered, None).await.unwrap();

        let shipment = shipments.get(id).await.unwrap();
        assert!(shipment.is_delivered);
        assert_eq!(shipment.status, "delivered");
    }

    #[tokio::test]
    async fn test_updated_at_moves_only_on_new_rows() {
        let (shipments, events, id) = setup().await;
        let batch = vec![activity(1, TrackingStatus::InTransit, "Origin scan")];

        events.merge_events(id, &batch, TrackingStatus::InTransit, None).await.unwrap();
        let after_first = shipments.get(id).await.unwrap().updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        events.merge_events(id, &batch, TrackingStatus::InTransit, None).await.unwrap();
        let after_second = shipments.get(id).await.unwrap().updated_at;

        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_events_listed_newest_first() {
        let (_, events, id) = setup().await;
        let batch = vec![
            activity(0, TrackingStatus::Delivered, "Delivered"),
            activity(3, TrackingStatus::InTransit, "Departed"),
            activity(9, TrackingStatus::InTransit, "Origin scan"),
        ];
        events.merge_events(id, &batch, TrackingStatus::Delivered, None).await.unwrap();

        let listed = events.list_for_shipment(id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].occurred_at > listed[1].occurred_at);
        assert!(listed[1].occurred_at > listed[2].occurred_at);
    }

    #[tokio::test]
    async fn test_events_cascade_on_delete() {
        let (shipments, events, id) = setup().await;
        let batch = vec![activity(1, TrackingStatus::InTransit, "Origin scan")];
        events.merge_events(id, &batch, TrackingStatus::InTransit, None).await.unwrap();

        shipments.delete(id).await.unwrap();
        assert_eq!(events.count_for_shipment(id).await.unwrap(), 0);
    }
}
