//! UPS tracking via the official Track API (OAuth2 client credentials).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{CarrierCode, TrackingStatus};

use super::{
    validation, CarrierClient, CarrierError, TrackOutcome, TrackRequest, TrackResponse,
    TrackResult, TrackingActivity, API_TIMEOUT_SECS,
};

const DEFAULT_BASE_URL: &str = "https://onlinetools.ups.com";

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// UPS API adapter. Stateless apart from the cached OAuth token.
pub struct UpsApiClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl UpsApiClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_token(&self, force_refresh: bool) -> Result<String, CarrierError> {
        let mut guard = self.token.lock().await;

        if !force_refresh {
            if let Some(ref cached) = *guard {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        debug!("Fetching new UPS OAuth token");
        let response = self
            .http
            .post(format!("{}/security/v1/oauth/token", self.base_url))
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CarrierError::auth("UPS OAuth credentials rejected"));
        }
        if !response.status().is_success() {
            return Err(CarrierError::server(format!(
                "UPS OAuth token request failed with {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CarrierError::server(format!("UPS token response unreadable: {}", e)))?;

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| CarrierError::auth("Missing access_token in UPS response"))?
            .to_string();
        let expires_in = body["expires_in"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| body["expires_in"].as_u64())
            .unwrap_or(3600);

        // 60 s buffer so an about-to-expire token is never used
        let expires_at = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });

        Ok(access_token)
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackResult, CarrierError> {
        let token = self.get_token(false).await?;

        let mut response = self.send_track(tracking_number, &token).await?;

        // One retry with a fresh token on 401
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let token = self.get_token(true).await?;
            response = self.send_track(tracking_number, &token).await?;
        }

        match response.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::UNAUTHORIZED => {
                return Err(CarrierError::auth("UPS rejected the access token"))
            }
            reqwest::StatusCode::NOT_FOUND => {
                return Err(CarrierError::not_found(format!(
                    "UPS has no record of {}",
                    tracking_number
                )))
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(CarrierError::rate_limit("UPS rate limit exceeded"))
            }
            s if s.is_server_error() => {
                return Err(CarrierError::server(format!("UPS returned {}", s)))
            }
            s => return Err(CarrierError::server(format!("UPS returned {}", s))),
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CarrierError::server(format!("UPS track response unreadable: {}", e)))?;

        parse_track_response(&body, tracking_number)
    }

    async fn send_track(
        &self,
        tracking_number: &str,
        token: &str,
    ) -> Result<reqwest::Response, CarrierError> {
        let response = self
            .http
            .get(format!(
                "{}/api/track/v1/details/{}",
                self.base_url, tracking_number
            ))
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .bearer_auth(token)
            .header("transId", format!("pkg-tracker-{}", tracking_number))
            .header("transactionSrc", "pkg-tracker")
            .send()
            .await?;
        Ok(response)
    }
}

fn parse_track_response(body: &Value, tracking_number: &str) -> Result<TrackResult, CarrierError> {
    let package = &body["trackResponse"]["shipment"][0]["package"][0];
    if package.is_null() {
        // UPS reports unknown numbers inside a 200 body
        let warning = body["trackResponse"]["shipment"][0]["warnings"][0]["message"]
            .as_str()
            .unwrap_or("no package data");
        return Err(CarrierError::not_found(format!(
            "UPS: {} ({})",
            warning, tracking_number
        )));
    }

    let mut events = Vec::new();
    if let Some(activities) = package["activity"].as_array() {
        for activity in activities {
            let description = activity["status"]["description"]
                .as_str()
                .unwrap_or_default()
                .trim()
                .to_string();
            let status = map_ups_status(
                activity["status"]["type"].as_str().unwrap_or_default(),
                &description,
            );
            let location = format_location(&activity["location"]["address"]);
            let occurred_at = parse_ups_timestamp(
                activity["date"].as_str().unwrap_or_default(),
                activity["time"].as_str().unwrap_or_default(),
            );

            events.push(TrackingActivity {
                occurred_at,
                location,
                status,
                description,
            });
        }
    }

    // UPS returns activities newest-first already; keep that order
    let status = events
        .first()
        .map(|e| e.status)
        .unwrap_or(TrackingStatus::Pending);

    let expected_delivery = package["deliveryDate"]
        .as_array()
        .and_then(|dates| dates.first())
        .and_then(|d| d["date"].as_str())
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok());

    Ok(TrackResult {
        status,
        events,
        updated_at: Utc::now(),
        expected_delivery,
        rate_limit: None,
    })
}

fn map_ups_status(status_type: &str, description: &str) -> TrackingStatus {
    match status_type {
        "D" => TrackingStatus::Delivered,
        "I" | "P" => TrackingStatus::InTransit,
        "O" => TrackingStatus::OutForDelivery,
        "X" => TrackingStatus::Exception,
        "RS" => TrackingStatus::Returned,
        "M" | "MV" => TrackingStatus::Pending,
        _ => super::map_status_text(description),
    }
}

fn format_location(address: &Value) -> Option<String> {
    let city = address["city"].as_str().unwrap_or_default().trim();
    let state = address["stateProvince"].as_str().unwrap_or_default().trim();
    match (city.is_empty(), state.is_empty()) {
        (false, false) => Some(format!("{}, {}", city, state)),
        (false, true) => Some(city.to_string()),
        (true, false) => Some(state.to_string()),
        (true, true) => None,
    }
}

fn parse_ups_timestamp(date: &str, time: &str) -> chrono::DateTime<Utc> {
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").unwrap_or_default();
    let time = NaiveTime::parse_from_str(time, "%H%M%S").unwrap_or_default();
    Utc.from_utc_datetime(&NaiveDateTime::new(date, time))
}

#[async_trait]
impl CarrierClient for UpsApiClient {
    fn validate(&self, tracking: &str) -> bool {
        validation::validate(CarrierCode::Ups, tracking)
    }

    async fn track(&self, request: &TrackRequest) -> Result<TrackResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for tracking_number in &request.tracking_numbers {
            let result = self.track_one(tracking_number).await;
            results.push(TrackOutcome {
                tracking_number: tracking_number.clone(),
                result,
            });
        }
        Ok(TrackResponse {
            results,
            rate_limit: None,
        })
    }

    fn carrier(&self) -> CarrierCode {
        CarrierCode::Ups
    }
}
