//! Carrier clients: one capability set, several transports.
//!
//! Every carrier is reached through the [`CarrierClient`] trait regardless of
//! whether the bytes travel over an official API, a headless browser, or an
//! HTML scrape. Adapter selection lives in [`factory::ClientFactory`], never
//! at call sites.

pub mod amazon;
pub mod browser;
pub mod dhl;
pub mod factory;
pub mod fedex;
pub mod headless;
pub mod scrape;
pub mod ups;
pub mod usps;
pub mod validation;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CarrierCode, TrackingStatus};

pub use factory::ClientFactory;

/// Default deadline for official-API calls
pub const API_TIMEOUT_SECS: u64 = 30;
/// Deadline for scraping transports
pub const SCRAPE_TIMEOUT_SECS: u64 = 45;
/// Deadline for batch headless navigation
pub const HEADLESS_TIMEOUT_SECS: u64 = 90;
/// Deadline for interactive (user-initiated) FedEx headless navigation
pub const HEADLESS_INTERACTIVE_TIMEOUT_SECS: u64 = 180;

/// A tracking request; most carriers accept a single number, USPS up to 10.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequest {
    pub tracking_numbers: Vec<String>,
}

impl TrackRequest {
    pub fn single(tracking_number: impl Into<String>) -> Self {
        Self {
            tracking_numbers: vec![tracking_number.into()],
        }
    }

    pub fn batch(tracking_numbers: Vec<String>) -> Self {
        Self { tracking_numbers }
    }
}

/// One scan line as reported by a carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingActivity {
    pub occurred_at: DateTime<Utc>,
    pub location: Option<String>,
    pub status: TrackingStatus,
    pub description: String,
}

/// Successful tracking data for one number. Events are newest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResult {
    pub status: TrackingStatus,
    pub events: Vec<TrackingActivity>,
    pub updated_at: DateTime<Utc>,
    pub expected_delivery: Option<NaiveDate>,
    /// Quota snapshot observed on the response that produced this result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl TrackResult {
    /// Empty benign result used by the email-only Amazon path
    pub fn empty() -> Self {
        Self {
            status: TrackingStatus::Pending,
            events: Vec::new(),
            updated_at: Utc::now(),
            expected_delivery: None,
            rate_limit: None,
        }
    }

    pub fn latest_status(&self) -> TrackingStatus {
        self.events.first().map(|e| e.status).unwrap_or(self.status)
    }
}

/// Per-number outcome inside a (possibly batched) response. A bad number in a
/// USPS batch fails here without poisoning its siblings.
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub tracking_number: String,
    pub result: std::result::Result<TrackResult, CarrierError>,
}

/// Quota snapshot some carriers (DHL) report alongside a response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Whole-call response: one outcome per requested number, in request order.
#[derive(Debug, Clone)]
pub struct TrackResponse {
    pub results: Vec<TrackOutcome>,
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl TrackResponse {
    pub fn single(tracking_number: impl Into<String>, result: TrackResult) -> Self {
        Self {
            results: vec![TrackOutcome {
                tracking_number: tracking_number.into(),
                result: Ok(result),
            }],
            rate_limit: None,
        }
    }

    /// The sole outcome of a single-number request; the response-level quota
    /// snapshot rides along on the result
    pub fn into_single(mut self) -> std::result::Result<TrackResult, CarrierError> {
        if self.results.is_empty() {
            return Err(CarrierError::server("carrier returned no results"));
        }
        let rate_limit = self.rate_limit;
        self.results.remove(0).result.map(|mut result| {
            result.rate_limit = rate_limit;
            result
        })
    }
}

/// Error taxonomy shared by every adapter. The `retryable` bit is the only
/// classification the updater consults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierError {
    pub kind: CarrierErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarrierErrorKind {
    Auth,
    RateLimit,
    NotFound,
    BotDetected,
    Server,
    Network,
    InvalidFormat,
    Unsupported,
}

impl CarrierErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierErrorKind::Auth => "AUTH",
            CarrierErrorKind::RateLimit => "RATE_LIMIT",
            CarrierErrorKind::NotFound => "NOT_FOUND",
            CarrierErrorKind::BotDetected => "BOT_DETECTED",
            CarrierErrorKind::Server => "SERVER_ERROR",
            CarrierErrorKind::Network => "NETWORK",
            CarrierErrorKind::InvalidFormat => "INVALID_FORMAT",
            CarrierErrorKind::Unsupported => "UNSUPPORTED",
        }
    }
}

impl CarrierError {
    pub fn new(kind: CarrierErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            retry_after: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::Auth, message, false)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::RateLimit, message, true)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::NotFound, message, false)
    }

    pub fn bot_detected(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::BotDetected, message, true)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::Server, message, true)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::Network, message, true)
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::InvalidFormat, message, false)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(CarrierErrorKind::Unsupported, message, false)
    }

    pub fn with_retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    /// HTTP status for the interactive refresh path
    pub fn status_code(&self) -> u16 {
        match self.kind {
            CarrierErrorKind::InvalidFormat | CarrierErrorKind::Unsupported => 400,
            CarrierErrorKind::RateLimit => 503,
            _ => 502,
        }
    }
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CarrierError {}

impl From<reqwest::Error> for CarrierError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            CarrierError::network(error.to_string())
        } else {
            CarrierError::server(error.to_string())
        }
    }
}

/// The capability set every adapter honors.
#[async_trait]
pub trait CarrierClient: Send + Sync {
    /// Structural/check-digit validation for this carrier's formats
    fn validate(&self, tracking: &str) -> bool;

    /// Fetch tracking data for 1..N numbers; one outcome per input, in order
    async fn track(&self, request: &TrackRequest) -> std::result::Result<TrackResponse, CarrierError>;

    /// The carrier this client fronts
    fn carrier(&self) -> CarrierCode;
}

/// Map free-form carrier status text into the common vocabulary. Adapters
/// with structured status codes map those directly and use this only for
/// scraped or rendered text.
pub fn map_status_text(text: &str) -> TrackingStatus {
    let lower = text.to_lowercase();
    if lower.contains("delivered") {
        TrackingStatus::Delivered
    } else if lower.contains("out for delivery") {
        TrackingStatus::OutForDelivery
    } else if lower.contains("return") {
        TrackingStatus::Returned
    } else if lower.contains("exception")
        || lower.contains("alert")
        || lower.contains("unable to deliver")
        || lower.contains("held")
    {
        TrackingStatus::Exception
    } else if lower.contains("in transit")
        || lower.contains("transit")
        || lower.contains("on the way")
        || lower.contains("departed")
        || lower.contains("arrived")
        || lower.contains("picked up")
        || lower.contains("origin scan")
        || lower.contains("accepted")
    {
        TrackingStatus::InTransit
    } else if lower.contains("label created")
        || lower.contains("pre-shipment")
        || lower.contains("shipping label")
        || lower.contains("order processed")
    {
        TrackingStatus::Pending
    } else {
        TrackingStatus::Unknown
    }
}
