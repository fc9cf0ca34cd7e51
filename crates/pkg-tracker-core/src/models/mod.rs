//! Domain entities persisted by the store and shared across components.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Carrier codes understood by the platform.
///
/// `Amazon` is a pseudo-carrier: it owns no tracking endpoint of its own and
/// either delegates to a real carrier or is email-only (Amazon Logistics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CarrierCode {
    Ups,
    Usps,
    Fedex,
    Dhl,
    Amazon,
}

impl CarrierCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierCode::Ups => "ups",
            CarrierCode::Usps => "usps",
            CarrierCode::Fedex => "fedex",
            CarrierCode::Dhl => "dhl",
            CarrierCode::Amazon => "amazon",
        }
    }

    /// Display name matching the seeded carrier reference rows
    pub fn display_name(&self) -> &'static str {
        match self {
            CarrierCode::Ups => "UPS",
            CarrierCode::Usps => "USPS",
            CarrierCode::Fedex => "FedEx",
            CarrierCode::Dhl => "DHL",
            CarrierCode::Amazon => "Amazon",
        }
    }

    /// All codes, in the order the updater sweeps them (USPS first, Amazon last)
    pub fn sweep_order() -> [CarrierCode; 5] {
        [
            CarrierCode::Usps,
            CarrierCode::Ups,
            CarrierCode::Fedex,
            CarrierCode::Dhl,
            CarrierCode::Amazon,
        ]
    }
}

impl FromStr for CarrierCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ups" => Ok(CarrierCode::Ups),
            "usps" => Ok(CarrierCode::Usps),
            "fedex" => Ok(CarrierCode::Fedex),
            "dhl" => Ok(CarrierCode::Dhl),
            "amazon" => Ok(CarrierCode::Amazon),
            other => Err(format!("unknown carrier code: {}", other)),
        }
    }
}

impl fmt::Display for CarrierCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common status vocabulary every adapter maps carrier strings into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    InTransit,
    OutForDelivery,
    Delivered,
    Exception,
    Returned,
    Unknown,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::InTransit => "in_transit",
            TrackingStatus::OutForDelivery => "out_for_delivery",
            TrackingStatus::Delivered => "delivered",
            TrackingStatus::Exception => "exception",
            TrackingStatus::Returned => "returned",
            TrackingStatus::Unknown => "unknown",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, TrackingStatus::Delivered)
    }
}

impl FromStr for TrackingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TrackingStatus::Pending),
            "in_transit" => Ok(TrackingStatus::InTransit),
            "out_for_delivery" => Ok(TrackingStatus::OutForDelivery),
            "delivered" => Ok(TrackingStatus::Delivered),
            "exception" => Ok(TrackingStatus::Exception),
            "returned" => Ok(TrackingStatus::Returned),
            _ => Ok(TrackingStatus::Unknown),
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The central record: one tracked package.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shipment {
    pub id: i64,
    pub tracking_number: String,
    pub carrier: CarrierCode,
    pub description: String,
    pub status: String,
    pub is_delivered: bool,
    pub expected_delivery: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Manual-refresh bookkeeping
    pub last_manual_refresh: Option<DateTime<Utc>>,
    pub manual_refresh_count: i64,

    // Auto-refresh bookkeeping
    pub last_auto_refresh: Option<DateTime<Utc>>,
    pub auto_refresh_count: i64,
    pub auto_refresh_enabled: bool,
    pub last_error: Option<String>,
    pub consecutive_failure_count: i64,

    // Amazon delegation
    pub amazon_order_number: Option<String>,
    pub delegated_carrier: Option<String>,
    pub delegated_tracking_number: Option<String>,
    pub is_amazon_logistics: bool,
}

impl Shipment {
    /// Delegation pair for an Amazon shipment, when fully resolved
    pub fn delegation(&self) -> Option<(CarrierCode, &str)> {
        let carrier = self.delegated_carrier.as_deref()?.parse().ok()?;
        let tracking = self.delegated_tracking_number.as_deref()?;
        if tracking.is_empty() {
            return None;
        }
        Some((carrier, tracking))
    }
}

/// A single scan event belonging to a shipment.
///
/// `(shipment_id, occurred_at, description)` is the idempotency key; colliding
/// inserts are dropped by the store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrackingEvent {
    pub id: i64,
    pub shipment_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub location: Option<String>,
    pub status: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Static carrier reference row, seeded at migration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Carrier {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub api_endpoint: String,
    pub active: bool,
}

/// Cached carrier response for one shipment (1:1 while live).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshCacheEntry {
    pub shipment_id: i64,
    pub response: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Terminal status of a scanned mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Processed,
    Skipped,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Processed => "processed",
            EmailStatus::Skipped => "skipped",
            EmailStatus::Failed => "failed",
        }
    }
}

/// One mailbox message that fell within a scan window.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEmail {
    pub id: i64,
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub from_address: String,
    pub subject: String,
    pub message_date: Option<DateTime<Utc>>,
    pub internal_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    #[serde(skip)]
    pub body_compressed: Option<Vec<u8>>,
    pub scan_method: String,
    pub processed_at: DateTime<Utc>,
    pub status: String,
    pub tracking_numbers: Option<String>,
    pub error_message: Option<String>,
}

/// Conversation aggregate keyed by the provider's thread id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailThread {
    pub id: i64,
    pub provider_thread_id: String,
    pub subject: String,
    pub participants: String,
    pub message_count: i64,
    pub first_message_date: Option<DateTime<Utc>>,
    pub last_message_date: Option<DateTime<Utc>>,
}

/// How an email↔shipment link came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Automatic,
    Manual,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Automatic => "automatic",
            LinkType::Manual => "manual",
        }
    }
}

/// Join row between ProcessedEmail and Shipment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailShipmentLink {
    pub id: i64,
    pub email_id: i64,
    pub shipment_id: i64,
    pub link_type: String,
    pub tracking_number: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for shipment creation, shared by the HTTP endpoint and the
/// email pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShipmentRequest {
    pub tracking_number: String,
    pub carrier: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub amazon_order_number: Option<String>,
    #[serde(default)]
    pub delegated_carrier: Option<String>,
    #[serde(default)]
    pub delegated_tracking_number: Option<String>,
    #[serde(default)]
    pub is_amazon_logistics: bool,
}

/// Request body for shipment update (description only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateShipmentRequest {
    pub description: String,
}

/// Aggregates for the dashboard endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_shipments: i64,
    pub in_transit: i64,
    pub delivered: i64,
    pub needs_attention: i64,
}
