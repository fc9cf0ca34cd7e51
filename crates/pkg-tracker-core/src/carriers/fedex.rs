//! FedEx tracking via the official Track API (OAuth2 client credentials).
//!
//! Only available when API credentials are configured; without them the
//! factory falls back to the headless adapter because the public FedEx
//! tracking page rejects non-browser clients.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{CarrierCode, TrackingStatus};

use super::{
    validation, CarrierClient, CarrierError, TrackOutcome, TrackRequest, TrackResponse,
    TrackResult, TrackingActivity, API_TIMEOUT_SECS,
};

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// FedEx API adapter.
pub struct FedexApiClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl FedexApiClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_url: api_url.into(),
            token: Mutex::new(None),
        }
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

        debug!("Fetching new FedEx OAuth token");
        let response = self
            .http
            .post(format!("{}/oauth/token", self.api_url))
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CarrierError::auth("FedEx OAuth credentials rejected"));
        }
        if !response.status().is_success() {
            return Err(CarrierError::server(format!(
                "FedEx OAuth token request failed with {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CarrierError::server(format!("FedEx token response unreadable: {}", e)))?;

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| CarrierError::auth("Missing access_token in FedEx response"))?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);

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

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let token = self.get_token(true).await?;
            response = self.send_track(tracking_number, &token).await?;
        }

        match response.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::UNAUTHORIZED => {
                return Err(CarrierError::auth("FedEx rejected the access token"))
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(CarrierError::rate_limit("FedEx rate limit exceeded"))
            }
            s if s.is_server_error() => {
                return Err(CarrierError::server(format!("FedEx returned {}", s)))
            }
            s => return Err(CarrierError::server(format!("FedEx returned {}", s))),
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CarrierError::server(format!("FedEx track response unreadable: {}", e)))?;

        parse_track_response(&body, tracking_number)
    }

    async fn send_track(
        &self,
        tracking_number: &str,
        token: &str,
    ) -> Result<reqwest::Response, CarrierError> {
        let request_body = json!({
            "trackingInfo": [{
                "trackingNumberInfo": { "trackingNumber": tracking_number }
            }],
            "includeDetailedScans": true
        });

        let response = self
            .http
            .post(format!("{}/track/v1/trackingnumbers", self.api_url))
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .bearer_auth(token)
            .json(&request_body)
            .send()
            .await?;
        Ok(response)
    }
}

fn parse_track_response(body: &Value, tracking_number: &str) -> Result<TrackResult, CarrierError> {
    let track_result = &body["output"]["completeTrackResults"][0]["trackResults"][0];
    if track_result.is_null() {
        return Err(CarrierError::server("FedEx returned no track results"));
    }

    if let Some(error) = track_result["error"].as_object() {
        let code = error.get("code").and_then(|c| c.as_str()).unwrap_or("");
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("tracking failed");
        if code.contains("NOTFOUND") {
            return Err(CarrierError::not_found(format!(
                "FedEx has no record of {}",
                tracking_number
            )));
        }
        return Err(CarrierError::server(format!("FedEx: {} ({})", message, code)));
    }

    let mut events = Vec::new();
    if let Some(scans) = track_result["scanEvents"].as_array() {
        for scan in scans {
            let description = scan["eventDescription"]
                .as_str()
                .unwrap_or_default()
                .trim()
                .to_string();
            let status = map_fedex_status(
                scan["derivedStatusCode"].as_str().unwrap_or_default(),
                &description,
            );
            let location = format_scan_location(&scan["scanLocation"]);
            let occurred_at = scan["date"]
                .as_str()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            events.push(TrackingActivity {
                occurred_at,
                location,
                status,
                description,
            });
        }
    }

    // FedEx scan events arrive newest-first; trust that ordering
    let status = match track_result["latestStatusDetail"]["derivedCode"].as_str() {
        Some(code) if !code.is_empty() => map_fedex_status(
            code,
            track_result["latestStatusDetail"]["statusByLocale"]
                .as_str()
                .unwrap_or_default(),
        ),
        _ => events.first().map(|e| e.status).unwrap_or(TrackingStatus::Pending),
    };

    let expected_delivery = track_result["dateAndTimes"]
        .as_array()
        .and_then(|entries| {
            entries.iter().find(|e| {
                matches!(e["type"].as_str(), Some("ESTIMATED_DELIVERY") | Some("ACTUAL_DELIVERY"))
            })
        })
        .and_then(|e| e["dateTime"].as_str())
        .and_then(parse_fedex_date);

    Ok(TrackResult {
        status,
        events,
        updated_at: Utc::now(),
        expected_delivery,
        rate_limit: None,
    })
}

fn parse_fedex_date(value: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.date_naive())
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&value[..value.len().min(10)], "%Y-%m-%d").ok())
}

fn map_fedex_status(code: &str, description: &str) -> TrackingStatus {
    match code {
        "DL" => TrackingStatus::Delivered,
        "OD" => TrackingStatus::OutForDelivery,
        "IT" | "DP" | "AR" | "PU" | "AF" => TrackingStatus::InTransit,
        "DE" | "SE" | "CA" => TrackingStatus::Exception,
        "RS" => TrackingStatus::Returned,
        "OC" | "IN" => TrackingStatus::Pending,
        _ => super::map_status_text(description),
    }
}

fn format_scan_location(location: &Value) -> Option<String> {
    let city = location["city"].as_str().unwrap_or_default().trim();
    let state = location["stateOrProvinceCode"]
        .as_str()
        .unwrap_or_default()
        .trim();
    match (city.is_empty(), state.is_empty()) {
        (false, false) => Some(format!("{}, {}", city, state)),
        (false, true) => Some(city.to_string()),
        (true, false) => Some(state.to_string()),
        (true, true) => None,
    }
}

#[async_trait]
impl CarrierClient for FedexApiClient {
    fn validate(&self, tracking: &str) -> bool {
        validation::validate(CarrierCode::Fedex, tracking)
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
        CarrierCode::Fedex
    }
}
