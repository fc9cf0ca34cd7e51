//! DHL tracking via the Unified Shipment Tracking API (simple key).
//!
//! DHL enforces a hard 250-calls/day quota; every response carries a
//! rate-limit snapshot that the updater watches so operators hear about
//! quota pressure before the carrier starts refusing calls.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use crate::models::{CarrierCode, TrackingStatus};

use super::{
    validation, CarrierClient, CarrierError, RateLimitSnapshot, TrackOutcome, TrackRequest,
    TrackResponse, TrackResult, TrackingActivity, API_TIMEOUT_SECS,
};

const DEFAULT_BASE_URL: &str = "https://api-eu.dhl.com/track/shipments";

/// DHL API adapter.
pub struct DhlApiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl DhlApiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn track_one(
        &self,
        tracking_number: &str,
    ) -> (Result<TrackResult, CarrierError>, Option<RateLimitSnapshot>) {
        debug!(tracking_number, "DHL track request");

        let response = match self
            .http
            .get(&self.base_url)
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .header("DHL-API-Key", &self.api_key)
            .query(&[("trackingNumber", tracking_number)])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return (Err(e.into()), None),
        };

        let rate_limit = parse_rate_limit_headers(response.headers());

        let result = match response.status() {
            s if s.is_success() => match response.json::<Value>().await {
                Ok(body) => parse_track_response(&body, tracking_number),
                Err(e) => Err(CarrierError::server(format!(
                    "DHL track response unreadable: {}",
                    e
                ))),
            },
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(CarrierError::auth("DHL API key rejected"))
            }
            reqwest::StatusCode::NOT_FOUND => Err(CarrierError::not_found(format!(
                "DHL has no record of {}",
                tracking_number
            ))),
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                let mut err = CarrierError::rate_limit(
                    "DHL daily quota exhausted; retry after the next quota reset",
                );
                if let Some(reset_at) = rate_limit.and_then(|r| r.reset_at) {
                    err = err.with_retry_after(reset_at);
                }
                Err(err)
            }
            s if s.is_server_error() => Err(CarrierError::server(format!("DHL returned {}", s))),
            s => Err(CarrierError::server(format!("DHL returned {}", s))),
        };

        (result, rate_limit)
    }
}

fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimitSnapshot> {
    fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    let limit = header_u64(headers, "RateLimit-Limit")?;
    let remaining = header_u64(headers, "RateLimit-Remaining")?;
    let reset_at = header_u64(headers, "RateLimit-Reset")
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

    Some(RateLimitSnapshot {
        limit,
        remaining,
        reset_at,
    })
}

fn parse_track_response(body: &Value, tracking_number: &str) -> Result<TrackResult, CarrierError> {
    let shipment = &body["shipments"][0];
    if shipment.is_null() {
        return Err(CarrierError::not_found(format!(
            "DHL has no record of {}",
            tracking_number
        )));
    }

    let mut events = Vec::new();
    if let Some(raw_events) = shipment["events"].as_array() {
        for event in raw_events {
            let description = event["description"]
                .as_str()
                .or_else(|| event["status"].as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            let status = map_dhl_status(
                event["statusCode"].as_str().unwrap_or_default(),
                &description,
            );
            let location = event["location"]["address"]["addressLocality"]
                .as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let occurred_at = parse_dhl_timestamp(event["timestamp"].as_str().unwrap_or_default());

            events.push(TrackingActivity {
                occurred_at,
                location,
                status,
                description,
            });
        }
    }

    let status = match shipment["status"]["statusCode"].as_str() {
        Some(code) if !code.is_empty() => map_dhl_status(
            code,
            shipment["status"]["description"].as_str().unwrap_or_default(),
        ),
        _ => events.first().map(|e| e.status).unwrap_or(TrackingStatus::Pending),
    };

    let expected_delivery = shipment["estimatedTimeOfDelivery"]
        .as_str()
        .and_then(|d| NaiveDate::parse_from_str(&d[..d.len().min(10)], "%Y-%m-%d").ok());

    Ok(TrackResult {
        status,
        events,
        updated_at: Utc::now(),
        expected_delivery,
        rate_limit: None,
    })
}

fn map_dhl_status(code: &str, description: &str) -> TrackingStatus {
    match code {
        "delivered" => TrackingStatus::Delivered,
        "transit" => TrackingStatus::InTransit,
        "pre-transit" => TrackingStatus::Pending,
        "failure" => TrackingStatus::Exception,
        "unknown" => TrackingStatus::Unknown,
        _ => super::map_status_text(description),
    }
}

fn parse_dhl_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| {
            // DHL sometimes omits the offset
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl CarrierClient for DhlApiClient {
    fn validate(&self, tracking: &str) -> bool {
        validation::validate(CarrierCode::Dhl, tracking)
    }

    async fn track(&self, request: &TrackRequest) -> Result<TrackResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        let mut latest_rate_limit = None;

        for tracking_number in &request.tracking_numbers {
            let (result, rate_limit) = self.track_one(tracking_number).await;
            if rate_limit.is_some() {
                latest_rate_limit = rate_limit;
            }
            results.push(TrackOutcome {
                tracking_number: tracking_number.clone(),
                result,
            });
        }

        Ok(TrackResponse {
            results,
            rate_limit: latest_rate_limit,
        })
    }

    fn carrier(&self) -> CarrierCode {
        CarrierCode::Dhl
    }
}
