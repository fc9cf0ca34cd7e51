//! Per-message processing: de-duplication, body retention, extraction, and
//! idempotent shipment creation with email↔shipment linking.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EmailConfig;
use crate::extractor::{Candidate, EmailContent, Extractor};
use crate::models::{CarrierCode, CreateShipmentRequest, EmailStatus, LinkType};
use crate::repository::{EmailRepository, NewProcessedEmail, ShipmentRepository};
use crate::{Error, Result};

use super::gmail::MailboxMessage;

/// Actor tag stamped on links the pipeline creates
const SCANNER_ACTOR: &str = "email-scanner";

const SCAN_METHOD: &str = "time-based";

/// The subset of a shipment the pipeline needs back from creation/lookup.
#[derive(Debug, Clone)]
pub struct ShipmentRef {
    pub id: i64,
    pub tracking_number: String,
}

/// Shipment creation contract. The pipeline goes through the same create
/// semantics as the public endpoint, either in process or over loopback HTTP.
#[async_trait]
pub trait ShipmentGateway: Send + Sync {
    async fn find_by_tracking(&self, tracking_number: &str) -> Result<Option<ShipmentRef>>;

    /// Duplicate tracking numbers surface as `Error::Duplicate`
    async fn create(&self, request: &CreateShipmentRequest) -> Result<ShipmentRef>;
}

/// In-process gateway used when the scanner runs inside the API server.
pub struct StoreGateway {
    shipments: ShipmentRepository,
}

impl StoreGateway {
    pub fn new(shipments: ShipmentRepository) -> Self {
        Self { shipments }
    }
}

#[async_trait]
impl ShipmentGateway for StoreGateway {
    async fn find_by_tracking(&self, tracking_number: &str) -> Result<Option<ShipmentRef>> {
        Ok(self
            .shipments
            .get_by_tracking_number(tracking_number)
            .await?
            .map(|s| ShipmentRef {
                id: s.id,
                tracking_number: s.tracking_number,
            }))
    }

    async fn create(&self, request: &CreateShipmentRequest) -> Result<ShipmentRef> {
        let shipment = self.shipments.create(request).await?;
        Ok(ShipmentRef {
            id: shipment.id,
            tracking_number: shipment.tracking_number,
        })
    }
}

/// Loopback-HTTP gateway used when the scanner runs as its own process.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    retry_count: u32,
    retry_delay: Duration,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, retry_count: u32, retry_delay_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            retry_count,
            retry_delay: Duration::from_secs(retry_delay_secs),
        }
    }

    async fn send_with_retry<F>(&self, mut attempt_fn: F) -> Result<reqwest::Response>
    where
        F: FnMut(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut last_error = None;
        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
            match attempt_fn(&self.http).send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(Error::network(format!(
                        "tracker API returned {}",
                        response.status()
                    )));
                }
                Ok(response) => return Ok(response),
                Err(e) => last_error = Some(Error::Network(e.to_string())),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::network("tracker API unreachable")))
    }
}

#[async_trait]
impl ShipmentGateway for HttpGateway {
    async fn find_by_tracking(&self, tracking_number: &str) -> Result<Option<ShipmentRef>> {
        let url = format!("{}/api/shipments", self.base_url);
        let response = self.send_with_retry(|http| http.get(&url)).await?;
        let shipments: Vec<Value> = response
            .json()
            .await
            .map_err(|e| Error::network(format!("tracker API response unreadable: {}", e)))?;

        Ok(shipments
            .iter()
            .find(|s| s["tracking_number"].as_str() == Some(tracking_number))
            .and_then(|s| {
                Some(ShipmentRef {
                    id: s["id"].as_i64()?,
                    tracking_number: tracking_number.to_string(),
                })
            }))
    }

    async fn create(&self, request: &CreateShipmentRequest) -> Result<ShipmentRef> {
        let url = format!("{}/api/shipments", self.base_url);
        let response = self
            .send_with_retry(|http| http.post(&url).json(request))
            .await?;

        match response.status().as_u16() {
            201 => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| Error::network(format!("tracker API response unreadable: {}", e)))?;
                Ok(ShipmentRef {
                    id: body["id"].as_i64().unwrap_or_default(),
                    tracking_number: request.tracking_number.clone(),
                })
            }
            409 => Err(Error::duplicate(request.tracking_number.clone())),
            400 => Err(Error::validation(format!(
                "tracker API rejected {}",
                request.tracking_number
            ))),
            status => Err(Error::network(format!("tracker API returned {}", status))),
        }
    }
}

/// What one processed message did to the store.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub status: Option<EmailStatus>,
    pub extracted: usize,
    pub shipments_created: usize,
    pub links_created: usize,
    /// True when the message had already been settled by an earlier scan
    pub deduplicated: bool,
}

pub struct EmailPipeline {
    emails: EmailRepository,
    gateway: Arc<dyn ShipmentGateway>,
    extractor: Extractor,
    config: EmailConfig,
}

impl EmailPipeline {
    pub fn new(
        emails: EmailRepository,
        gateway: Arc<dyn ShipmentGateway>,
        extractor: Extractor,
        config: EmailConfig,
    ) -> Self {
        Self {
            emails,
            gateway,
            extractor,
            config,
        }
    }

    /// Process one fetched message. Failures are localized: the error lands
    /// on the ProcessedEmail row and the call still returns Ok.
    pub async fn process_message(&self, message: &MailboxMessage) -> Result<ProcessReport> {
        // Idempotency: settled messages make no further state change
        if let Some(existing) = self
            .emails
            .find_by_provider_message_id(&message.provider_message_id)
            .await?
        {
            if existing.status == EmailStatus::Processed.as_str()
                || existing.status == EmailStatus::Skipped.as_str()
            {
                debug!(
                    provider_message_id = %message.provider_message_id,
                    "message already settled, dropping"
                );
                return Ok(ProcessReport {
                    deduplicated: true,
                    ..Default::default()
                });
            }
        }

        match self.process_inner(message).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(
                    provider_message_id = %message.provider_message_id,
                    "message processing failed: {}",
                    e
                );
                let mut record = self.base_record(message, EmailStatus::Failed, None);
                record.error_message = Some(e.to_string());
                self.emails.record(&record).await?;
                Ok(ProcessReport {
                    status: Some(EmailStatus::Failed),
                    ..Default::default()
                })
            }
        }
    }

    async fn process_inner(&self, message: &MailboxMessage) -> Result<ProcessReport> {
        let content = EmailContent {
            from_address: message.from_address.clone(),
            subject: message.subject.clone(),
            body_text: message.body_text.clone(),
            body_html: message.body_html.clone(),
        };

        let candidates = self.extractor.extract(&content).await;
        let accepted: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.confidence >= self.config.min_confidence)
            .collect();

        let mut report = ProcessReport {
            extracted: accepted.len(),
            ..Default::default()
        };

        let mut links: Vec<(i64, String)> = Vec::new();
        if !self.config.dry_run {
            for candidate in &accepted {
                match self.resolve_shipment(candidate, message).await {
                    Ok((shipment, created)) => {
                        if created {
                            report.shipments_created += 1;
                        }
                        links.push((shipment.id, shipment.tracking_number));
                    }
                    Err(e) => {
                        // One bad candidate must not sink the message
                        warn!(
                            tracking_number = %candidate.tracking_number,
                            "candidate could not be materialized: {}",
                            e
                        );
                    }
                }
            }
        } else if !accepted.is_empty() {
            info!(
                provider_message_id = %message.provider_message_id,
                extracted = accepted.len(),
                "dry run: extractions recorded, no shipments created"
            );
        }

        let status = if accepted.is_empty() {
            EmailStatus::Skipped
        } else {
            EmailStatus::Processed
        };

        let numbers: Vec<&str> = accepted.iter().map(|c| c.tracking_number.as_str()).collect();
        let tracking_json = if numbers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&numbers)?)
        };

        let record = self.base_record(message, status, tracking_json);
        let stored = self.emails.record(&record).await?;

        for (shipment_id, tracking_number) in links {
            match self
                .emails
                .create_link(
                    stored.id,
                    shipment_id,
                    LinkType::Automatic,
                    &tracking_number,
                    SCANNER_ACTOR,
                )
                .await
            {
                Ok(_) => report.links_created += 1,
                Err(Error::Duplicate(_)) => {}
                Err(e) => warn!(shipment_id, "link creation failed: {}", e),
            }
        }

        if let Some(thread_id) = &message.provider_thread_id {
            self.emails
                .upsert_thread(
                    thread_id,
                    &message.subject,
                    &message.from_address,
                    message.message_date.or(Some(message.internal_timestamp)),
                )
                .await?;
        }

        report.status = Some(status);
        Ok(report)
    }

    /// Find or create the shipment for one accepted candidate. Returns the
    /// shipment and whether this call created it.
    async fn resolve_shipment(
        &self,
        candidate: &Candidate,
        message: &MailboxMessage,
    ) -> Result<(ShipmentRef, bool)> {
        if let Some(existing) = self
            .gateway
            .find_by_tracking(&candidate.tracking_number)
            .await?
        {
            return Ok((existing, false));
        }

        let request = build_create_request(candidate, message);
        match self.gateway.create(&request).await {
            Ok(created) => {
                info!(
                    tracking_number = %created.tracking_number,
                    carrier = %candidate.carrier,
                    "shipment created from email"
                );
                Ok((created, true))
            }
            // Lost a race with another creator; link to the winner
            Err(Error::Duplicate(_)) => {
                let existing = self
                    .gateway
                    .find_by_tracking(&candidate.tracking_number)
                    .await?
                    .ok_or_else(|| {
                        Error::email("duplicate reported but shipment not found")
                    })?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    fn base_record(
        &self,
        message: &MailboxMessage,
        status: EmailStatus,
        tracking_numbers: Option<String>,
    ) -> NewProcessedEmail {
        let (body_text, body_html, body_compressed) = if !self.config.body_storage_enabled {
            (None, None, None)
        } else if self.config.body_compression_enabled {
            (
                None,
                None,
                compress_bodies(message.body_text.as_deref(), message.body_html.as_deref()),
            )
        } else {
            (message.body_text.clone(), message.body_html.clone(), None)
        };

        NewProcessedEmail {
            provider_message_id: message.provider_message_id.clone(),
            provider_thread_id: message.provider_thread_id.clone(),
            from_address: message.from_address.clone(),
            subject: message.subject.clone(),
            message_date: message.message_date,
            internal_timestamp: message.internal_timestamp,
            body_text,
            body_html,
            body_compressed,
            scan_method: SCAN_METHOD.to_string(),
            status,
            tracking_numbers,
            error_message: None,
        }
    }
}

/// Compose the shipment description per the precedence rule: description and
/// merchant, one of them, the subject, then a sender fallback.
pub fn compose_description(candidate: &Candidate, subject: &str, from_address: &str) -> String {
    match (&candidate.description, &candidate.merchant) {
        (Some(description), Some(merchant)) => format!("{} from {}", description, merchant),
        (Some(description), None) => description.clone(),
        (None, Some(merchant)) => format!("Package from {}", merchant),
        (None, None) => {
            if !subject.trim().is_empty() {
                subject.trim().to_string()
            } else {
                format!("Package from {}", from_address)
            }
        }
    }
}

fn build_create_request(candidate: &Candidate, message: &MailboxMessage) -> CreateShipmentRequest {
    let is_amazon = candidate.carrier == CarrierCode::Amazon;
    let is_order_number =
        is_amazon && crate::carriers::validation::is_amazon_order_number(&candidate.tracking_number);

    CreateShipmentRequest {
        tracking_number: candidate.tracking_number.clone(),
        carrier: candidate.carrier.as_str().to_string(),
        description: compose_description(candidate, &message.subject, &message.from_address),
        amazon_order_number: is_order_number.then(|| candidate.tracking_number.clone()),
        delegated_carrier: None,
        delegated_tracking_number: None,
        is_amazon_logistics: is_amazon && candidate.tracking_number.starts_with("TBA"),
    }
}

/// Gzip both bodies into one blob: a small JSON envelope so text and HTML
/// survive side by side.
pub fn compress_bodies(text: Option<&str>, html: Option<&str>) -> Option<Vec<u8>> {
    if text.is_none() && html.is_none() {
        return None;
    }
    let envelope = serde_json::json!({ "text": text, "html": html });
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(envelope.to_string().as_bytes()).ok()?;
    encoder.finish().ok()
}

/// Inverse of [`compress_bodies`].
pub fn decompress_bodies(blob: &[u8]) -> Option<(Option<String>, Option<String>)> {
    let mut decoder = GzDecoder::new(blob);
    let mut raw = String::new();
    decoder.read_to_string(&mut raw).ok()?;
    let envelope: Value = serde_json::from_str(&raw).ok()?;
    Some((
        envelope["text"].as_str().map(str::to_string),
        envelope["html"].as_str().map(str::to_string),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, migrate::auto_migrate};
    use crate::extractor::CandidateSource;
    use crate::repository::Store;
    use chrono::Utc;

    async fn pipeline_with(config: EmailConfig) -> (EmailPipeline, Store) {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();
        let store = Store::new(pool);
        let gateway = Arc::new(StoreGateway::new(store.shipments.clone()));
        let pipeline = EmailPipeline::new(
            store.emails.clone(),
            gateway,
            Extractor::new(),
            config,
        );
        (pipeline, store)
    }

    fn amazon_message() -> MailboxMessage {
        MailboxMessage {
            provider_message_id: "msg-1".into(),
            provider_thread_id: Some("thread-1".into()),
            from_address: "ship-confirm@amazon.com".into(),
            subject: "Your Amazon.com order has shipped".into(),
            message_date: Some(Utc::now()),
            internal_timestamp: Utc::now(),
            body_text: Some(
                "Order 113-1234567-1234567 was shipped. UPS tracking 1Z999AA10123456784".into(),
            ),
            body_html: None,
        }
    }

    #[tokio::test]
    async fn test_dry_run_records_but_creates_nothing() {
        let config = EmailConfig {
            dry_run: true,
            ..Default::default()
        };
        let (pipeline, store) = pipeline_with(config).await;

        let report = pipeline.process_message(&amazon_message()).await.unwrap();
        assert_eq!(report.status, Some(EmailStatus::Processed));
        assert_eq!(report.extracted, 2);
        assert_eq!(report.shipments_created, 0);
        assert_eq!(report.links_created, 0);

        let email = store
            .emails
            .find_by_provider_message_id("msg-1")
            .await
            .unwrap()
            .unwrap();
        let numbers = email.tracking_numbers.unwrap();
        assert!(numbers.contains("1Z999AA10123456784"));
        assert!(numbers.contains("113-1234567-1234567"));
        assert!(store.shipments.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_run_creates_shipment_and_link() {
        let (pipeline, store) = pipeline_with(EmailConfig::default()).await;

        let report = pipeline.process_message(&amazon_message()).await.unwrap();
        assert_eq!(report.status, Some(EmailStatus::Processed));
        assert_eq!(report.shipments_created, 2);
        assert_eq!(report.links_created, 2);

        let ups = store
            .shipments
            .get_by_tracking_number("1Z999AA10123456784")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ups.carrier, CarrierCode::Ups);
        assert!(ups.description.contains("Amazon"));

        // Second scan over the same message is a no-op
        let second = pipeline.process_message(&amazon_message()).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(store.shipments.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_existing_shipment_is_linked_not_duplicated() {
        let (pipeline, store) = pipeline_with(EmailConfig::default()).await;

        store
            .shipments
            .create(&CreateShipmentRequest {
                tracking_number: "1Z999AA10123456784".into(),
                carrier: "ups".into(),
                description: "pre-existing".into(),
                amazon_order_number: None,
                delegated_carrier: None,
                delegated_tracking_number: None,
                is_amazon_logistics: false,
            })
            .await
            .unwrap();

        let report = pipeline.process_message(&amazon_message()).await.unwrap();
        // The UPS number links to the existing shipment; only the Amazon
        // order number creates a new one
        assert_eq!(report.shipments_created, 1);
        assert_eq!(report.links_created, 2);

        let ups = store
            .shipments
            .get_by_tracking_number("1Z999AA10123456784")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ups.description, "pre-existing");
    }

    #[tokio::test]
    async fn test_no_candidates_is_skipped() {
        let (pipeline, store) = pipeline_with(EmailConfig::default()).await;
        let mut message = amazon_message();
        message.body_text = Some("Thanks for your purchase!".into());
        message.subject = "Receipt".into();

        let report = pipeline.process_message(&message).await.unwrap();
        assert_eq!(report.status, Some(EmailStatus::Skipped));

        // Skipped messages are settled too
        let second = pipeline.process_message(&message).await.unwrap();
        assert!(second.deduplicated);
        assert!(store.shipments.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_html_only_body_stored_as_html() {
        let (pipeline, store) = pipeline_with(EmailConfig::default()).await;
        let mut message = amazon_message();
        message.body_text = None;
        message.body_html =
            Some("<table><tr><td>Tracking</td><td>1Z999AA10123456784</td></tr></table>".into());

        let report = pipeline.process_message(&message).await.unwrap();
        assert_eq!(report.status, Some(EmailStatus::Processed));

        let email = store
            .emails
            .find_by_provider_message_id("msg-1")
            .await
            .unwrap()
            .unwrap();
        assert!(email.body_text.is_none());
        assert!(email.body_html.is_some());
    }

    #[tokio::test]
    async fn test_compressed_body_round_trip() {
        let config = EmailConfig {
            body_compression_enabled: true,
            ..Default::default()
        };
        let (pipeline, store) = pipeline_with(config).await;

        pipeline.process_message(&amazon_message()).await.unwrap();
        let email = store
            .emails
            .find_by_provider_message_id("msg-1")
            .await
            .unwrap()
            .unwrap();
        assert!(email.body_text.is_none());

        let blob = email.body_compressed.unwrap();
        let (text, html) = decompress_bodies(&blob).unwrap();
        assert!(text.unwrap().contains("1Z999AA10123456784"));
        assert!(html.is_none());
    }

    #[tokio::test]
    async fn test_thread_aggregated() {
        let (pipeline, store) = pipeline_with(EmailConfig::default()).await;
        pipeline.process_message(&amazon_message()).await.unwrap();

        let thread = store.emails.get_thread("thread-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 1);
    }

    #[test]
    fn test_compose_description_precedence() {
        let mut candidate = Candidate {
            tracking_number: "1Z999AA10123456784".into(),
            carrier: CarrierCode::Ups,
            description: Some("mechanical keyboard".into()),
            merchant: Some("Amazon".into()),
            confidence: 0.9,
            source: CandidateSource::Regex,
        };

        assert_eq!(
            compose_description(&candidate, "subject", "a@b.com"),
            "mechanical keyboard from Amazon"
        );

        candidate.merchant = None;
        assert_eq!(compose_description(&candidate, "subject", "a@b.com"), "mechanical keyboard");

        candidate.description = None;
        candidate.merchant = Some("Amazon".into());
        assert_eq!(compose_description(&candidate, "subject", "a@b.com"), "Package from Amazon");

        candidate.merchant = None;
        assert_eq!(compose_description(&candidate, "Your order", "a@b.com"), "Your order");
        assert_eq!(compose_description(&candidate, "  ", "a@b.com"), "Package from a@b.com");
    }
}
