//! Persistence for the email-ingest pipeline: processed messages, threads,
//! email↔shipment links, body retention, and the scanner's high-water mark.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{EmailShipmentLink, EmailStatus, EmailThread, LinkType, ProcessedEmail};
use crate::{Error, Result};

/// Fields recorded for a freshly scanned message.
#[derive(Debug, Clone)]
pub struct NewProcessedEmail {
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub from_address: String,
    pub subject: String,
    pub message_date: Option<DateTime<Utc>>,
    pub internal_timestamp: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub body_compressed: Option<Vec<u8>>,
    pub scan_method: String,
    pub status: EmailStatus,
    pub tracking_numbers: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct EmailRepository {
    pool: SqlitePool,
}

impl EmailRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ProcessedEmail>> {
        let email = sqlx::query_as::<_, ProcessedEmail>(
            "SELECT * FROM processed_emails WHERE provider_message_id = ?1",
        )
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(email)
    }

    pub async fn get(&self, id: i64) -> Result<ProcessedEmail> {
        sqlx::query_as::<_, ProcessedEmail>("SELECT * FROM processed_emails WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("email {}", id)))
    }

    /// Record (or re-record) a scanned message. The provider message id is
    /// the natural key; a second record for the same id overwrites outcome
    /// fields, which lets a `failed` message be retried on a later scan.
    pub async fn record(&self, email: &NewProcessedEmail) -> Result<ProcessedEmail> {
        sqlx::query(
            r#"
            INSERT INTO processed_emails (
                provider_message_id, provider_thread_id, from_address, subject,
                message_date, internal_timestamp, body_text, body_html,
                body_compressed, scan_method, processed_at, status,
                tracking_numbers, error_message
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT (provider_message_id) DO UPDATE SET
                processed_at = excluded.processed_at,
                status = excluded.status,
                tracking_numbers = excluded.tracking_numbers,
                error_message = excluded.error_message,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                body_compressed = excluded.body_compressed
            "#,
        )
        .bind(&email.provider_message_id)
        .bind(&email.provider_thread_id)
        .bind(&email.from_address)
        .bind(&email.subject)
        .bind(email.message_date)
        .bind(email.internal_timestamp)
        .bind(&email.body_text)
        .bind(&email.body_html)
        .bind(&email.body_compressed)
        .bind(&email.scan_method)
        .bind(Utc::now())
        .bind(email.status.as_str())
        .bind(&email.tracking_numbers)
        .bind(&email.error_message)
        .execute(&self.pool)
        .await?;

        self.find_by_provider_message_id(&email.provider_message_id)
            .await?
            .ok_or_else(|| Error::email("recorded email vanished"))
    }

    /// Emails linked to a shipment, newest first.
    pub async fn emails_for_shipment(&self, shipment_id: i64) -> Result<Vec<ProcessedEmail>> {
        let emails = sqlx::query_as::<_, ProcessedEmail>(
            r#"
            SELECT e.* FROM processed_emails e
            JOIN email_shipment_links l ON l.email_id = e.id
            WHERE l.shipment_id = ?1
            ORDER BY e.internal_timestamp DESC
            "#,
        )
        .bind(shipment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(emails)
    }

    /// Messages observed in one provider thread, oldest first.
    pub async fn thread_messages(&self, provider_thread_id: &str) -> Result<Vec<ProcessedEmail>> {
        let emails = sqlx::query_as::<_, ProcessedEmail>(
            "SELECT * FROM processed_emails WHERE provider_thread_id = ?1 ORDER BY internal_timestamp ASC",
        )
        .bind(provider_thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(emails)
    }

    pub async fn get_thread(&self, provider_thread_id: &str) -> Result<Option<EmailThread>> {
        let thread = sqlx::query_as::<_, EmailThread>(
            "SELECT * FROM email_threads WHERE provider_thread_id = ?1",
        )
        .bind(provider_thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(thread)
    }

    /// Fold one observed message into its thread aggregate.
    pub async fn upsert_thread(
        &self,
        provider_thread_id: &str,
        subject: &str,
        participant: &str,
        message_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let existing = self.get_thread(provider_thread_id).await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO email_threads
                        (provider_thread_id, subject, participants, message_count,
                         first_message_date, last_message_date)
                    VALUES (?1, ?2, ?3, 1, ?4, ?4)
                    "#,
                )
                .bind(provider_thread_id)
                .bind(subject)
                .bind(participant)
                .bind(message_date)
                .execute(&self.pool)
                .await?;
            }
            Some(thread) => {
                let mut participants: Vec<&str> = thread
                    .participants
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect();
                if !participant.is_empty() && !participants.contains(&participant) {
                    participants.push(participant);
                }
                let first = match (thread.first_message_date, message_date) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let last = match (thread.last_message_date, message_date) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };

                sqlx::query(
                    r#"
                    UPDATE email_threads
                    SET participants = ?1,
                        message_count = message_count + 1,
                        first_message_date = ?2,
                        last_message_date = ?3
                    WHERE provider_thread_id = ?4
                    "#,
                )
                .bind(participants.join(", "))
                .bind(first)
                .bind(last)
                .bind(provider_thread_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Create an email↔shipment link; `(email_id, shipment_id)` is unique.
    pub async fn create_link(
        &self,
        email_id: i64,
        shipment_id: i64,
        link_type: LinkType,
        tracking_number: &str,
        created_by: &str,
    ) -> Result<EmailShipmentLink> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_shipment_links
                (email_id, shipment_id, link_type, tracking_number, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(email_id)
        .bind(shipment_id)
        .bind(link_type.as_str())
        .bind(tracking_number)
        .bind(created_by)
        .bind(Utc::now())
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
                        "email {} is already linked to shipment {}",
                        email_id, shipment_id
                    )));
                }
                if e.as_database_error()
                    .map(|d| d.is_foreign_key_violation())
                    .unwrap_or(false)
                {
                    return Err(Error::not_found("email or shipment"));
                }
                return Err(Error::Database(e));
            }
        };

        let link = sqlx::query_as::<_, EmailShipmentLink>(
            "SELECT * FROM email_shipment_links WHERE id = ?1",
        )
        .bind(inserted.last_insert_rowid())
        .fetch_one(&self.pool)
        .await?;
        Ok(link)
    }

    pub async fn delete_link(&self, email_id: i64, shipment_id: i64) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM email_shipment_links WHERE email_id = ?1 AND shipment_id = ?2",
        )
        .bind(email_id)
        .bind(shipment_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "link between email {} and shipment {}",
                email_id, shipment_id
            )));
        }
        Ok(())
    }

    pub async fn links_for_email(&self, email_id: i64) -> Result<Vec<EmailShipmentLink>> {
        let links = sqlx::query_as::<_, EmailShipmentLink>(
            "SELECT * FROM email_shipment_links WHERE email_id = ?1 ORDER BY created_at",
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    /// Null out stored bodies older than the retention horizon. The rows stay
    /// behind as de-duplication markers. Returns the count pruned.
    pub async fn prune_bodies(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE processed_emails
            SET body_text = NULL, body_html = NULL, body_compressed = NULL
            WHERE internal_timestamp < ?1
              AND (body_text IS NOT NULL OR body_html IS NOT NULL OR body_compressed IS NOT NULL)
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Scanner high-water mark; None before the first completed scan.
    pub async fn high_water_mark(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT high_water_mark FROM scan_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("high_water_mark")))
    }

    pub async fn set_high_water_mark(&self, mark: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_state (id, high_water_mark) VALUES (1, ?1)
            ON CONFLICT (id) DO UPDATE SET high_water_mark = excluded.high_water_mark
            "#,
        )
        .bind(mark)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, migrate::auto_migrate};
    use crate::models::CreateShipmentRequest;
    use crate::repository::ShipmentRepository;

    async fn setup() -> (EmailRepository, ShipmentRepository) {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();
        (
            EmailRepository::new(pool.clone()),
            ShipmentRepository::new(pool),
        )
    }

    fn sample_email(message_id: &str) -> NewProcessedEmail {
        NewProcessedEmail {
            provider_message_id: message_id.to_string(),
            provider_thread_id: Some("thread-1".to_string()),
            from_address: "ship-confirm@amazon.com".to_string(),
            subject: "Your package has shipped".to_string(),
            message_date: Some(Utc::now()),
            internal_timestamp: Utc::now(),
            body_text: Some("UPS tracking 1Z999AA10123456784".to_string()),
            body_html: None,
            body_compressed: None,
            scan_method: "time-based".to_string(),
            status: EmailStatus::Processed,
            tracking_numbers: Some("[\"1Z999AA10123456784\"]".to_string()),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_find() {
        let (emails, _) = setup().await;
        let recorded = emails.record(&sample_email("msg-1")).await.unwrap();
        assert_eq!(recorded.status, "processed");

        let found = emails
            .find_by_provider_message_id("msg-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, recorded.id);
    }

    #[tokio::test]
    async fn test_record_same_message_overwrites_outcome() {
        let (emails, _) = setup().await;
        let mut email = sample_email("msg-1");
        email.status = EmailStatus::Failed;
        email.error_message = Some("mailbox hiccup".into());
        let first = emails.record(&email).await.unwrap();

        email.status = EmailStatus::Processed;
        email.error_message = None;
        let second = emails.record(&email).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, "processed");
        assert!(second.error_message.is_none());
    }

    #[tokio::test]
    async fn test_link_uniqueness() {
        let (emails, shipments) = setup().await;
        let email = emails.record(&sample_email("msg-1")).await.unwrap();
        let shipment = shipments
            .create(&CreateShipmentRequest {
                tracking_number: "1Z999AA10123456784".into(),
                carrier: "ups".into(),
                description: String::new(),
                amazon_order_number: None,
                delegated_carrier: None,
                delegated_tracking_number: None,
                is_amazon_logistics: false,
            })
            .await
            .unwrap();

        emails
            .create_link(email.id, shipment.id, LinkType::Automatic, "1Z999AA10123456784", "scanner")
            .await
            .unwrap();
        let err = emails
            .create_link(email.id, shipment.id, LinkType::Manual, "1Z999AA10123456784", "user")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        emails.delete_link(email.id, shipment.id).await.unwrap();
        assert!(matches!(
            emails.delete_link(email.id, shipment.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_link_requires_existing_rows() {
        let (emails, _) = setup().await;
        let email = emails.record(&sample_email("msg-1")).await.unwrap();
        let err = emails
            .create_link(email.id, 999, LinkType::Manual, "x", "user")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_thread_aggregation() {
        let (emails, _) = setup().await;
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let t1 = Utc::now();

        emails
            .upsert_thread("thread-1", "Your package", "a@example.com", Some(t0))
            .await
            .unwrap();
        emails
            .upsert_thread("thread-1", "Your package", "b@example.com", Some(t1))
            .await
            .unwrap();

        let thread = emails.get_thread("thread-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
        assert!(thread.participants.contains("a@example.com"));
        assert!(thread.participants.contains("b@example.com"));
        assert_eq!(thread.first_message_date.unwrap(), t0);
        assert_eq!(thread.last_message_date.unwrap(), t1);
    }

    #[tokio::test]
    async fn test_prune_bodies_keeps_rows() {
        let (emails, _) = setup().await;
        let mut old = sample_email("msg-old");
        old.internal_timestamp = Utc::now() - chrono::Duration::days(120);
        emails.record(&old).await.unwrap();
        emails.record(&sample_email("msg-new")).await.unwrap();

        let pruned = emails
            .prune_bodies(Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let kept = emails
            .find_by_provider_message_id("msg-old")
            .await
            .unwrap()
            .unwrap();
        assert!(kept.body_text.is_none());
        assert_eq!(kept.status, "processed");

        let fresh = emails
            .find_by_provider_message_id("msg-new")
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.body_text.is_some());
    }

    #[tokio::test]
    async fn test_high_water_mark_round_trip() {
        let (emails, _) = setup().await;
        assert!(emails.high_water_mark().await.unwrap().is_none());

        let mark = Utc::now();
        emails.set_high_water_mark(mark).await.unwrap();
        assert_eq!(emails.high_water_mark().await.unwrap().unwrap(), mark);
    }
}
