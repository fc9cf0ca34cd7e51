//! FedEx tracking via a headless browser.
//!
//! The public FedEx tracking page is an Angular SPA behind bot detection, so
//! without API credentials the only workable transport is a real browser
//! engine. Page content discriminates three failure modes that must not be
//! conflated: a bot-detection block, a transient carrier outage, and a
//! genuinely unknown tracking number.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use crate::models::{CarrierCode, TrackingStatus};

use super::browser::{Browser, BrowserConfig};
use super::{
    map_status_text, validation, CarrierClient, CarrierError, TrackOutcome, TrackRequest,
    TrackResponse, TrackResult, TrackingActivity, HEADLESS_INTERACTIVE_TIMEOUT_SECS,
    HEADLESS_TIMEOUT_SECS,
};

const TRACK_URL: &str = "https://www.fedex.com/fedextrack/?trknbr=";

/// The phrase FedEx serves in place of results when it has flagged the client
const BOT_BLOCK_PHRASE: &str =
    "unfortunately we are unable to retrieve your tracking results at this time";

/// JS run in the rendered page to lift the travel history out of the DOM.
/// Emits a JSON string: `[{date, time, status, location}, ...]`, newest first.
const EXTRACT_EVENTS_JS: &str = r#"
(() => {
    const rows = document.querySelectorAll(
        '.travel-history-table tr, [data-testid="travel-history"] li, .fdx-c-table__tbody tr'
    );
    const events = [];
    for (const row of rows) {
        const cell = (sel) => {
            const el = row.querySelector(sel);
            return el ? el.innerText.trim() : '';
        };
        const status = cell('.status, [data-testid="status"], td:nth-child(2)');
        if (!status) continue;
        events.push({
            date: row.getAttribute('data-date') || cell('.date, [data-testid="date"], td:nth-child(1)'),
            time: cell('.time, [data-testid="time"]'),
            status: status,
            location: cell('.location, [data-testid="location"], td:nth-child(3)')
        });
    }
    return JSON.stringify(events);
})()
"#;

/// Expression that is truthy once the Angular app has rendered either a
/// travel history or a definitive message.
const READY_JS: &str = r#"
(() => {
    const text = document.body ? document.body.innerText.toLowerCase() : '';
    if (text.includes('unable to retrieve')) return true;
    if (text.includes('not found') || text.includes("couldn't find")) return true;
    return document.querySelectorAll(
        '.travel-history-table tr, [data-testid="travel-history"] li, .fdx-c-table__tbody tr'
    ).length > 0;
})()
"#;

/// Headless FedEx adapter.
pub struct FedexHeadlessClient {
    browser: Arc<Browser>,
    /// Interactive refreshes get the longer deadline
    interactive: bool,
}

impl FedexHeadlessClient {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            browser: Arc::new(Browser::new(config)),
            interactive: false,
        }
    }

    pub fn with_browser(browser: Arc<Browser>) -> Self {
        Self {
            browser,
            interactive: false,
        }
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    fn deadline(&self) -> Duration {
        if self.interactive {
            Duration::from_secs(HEADLESS_INTERACTIVE_TIMEOUT_SECS)
        } else {
            Duration::from_secs(HEADLESS_TIMEOUT_SECS)
        }
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackResult, CarrierError> {
        let deadline = self.deadline();
        match tokio::time::timeout(deadline, self.navigate_and_extract(tracking_number)).await {
            Ok(result) => result,
            Err(_) => Err(CarrierError::network(format!(
                "FedEx page did not render within {:?}",
                deadline
            ))),
        }
    }

    async fn navigate_and_extract(
        &self,
        tracking_number: &str,
    ) -> Result<TrackResult, CarrierError> {
        let mut page = self.browser.checkout_page().await?;

        let outcome = async {
            page.navigate(&format!("{}{}", TRACK_URL, tracking_number)).await?;
            page.wait_for(READY_JS, Duration::from_secs(45)).await?;

            let body_text = page.body_text().await?;
            if let Some(error) = classify_page_text(&body_text, tracking_number) {
                return Err(error);
            }

            let raw = page.evaluate(EXTRACT_EVENTS_JS).await?;
            let events = parse_extracted_events(&raw);
            debug!(tracking_number, events = events.len(), "FedEx headless extraction");

            if events.is_empty() {
                return Err(CarrierError::server(format!(
                    "FedEx page rendered but no travel history was found for {}",
                    tracking_number
                )));
            }

            let status = events.first().map(|e| e.status).unwrap_or(TrackingStatus::Pending);
            Ok(TrackResult {
                status,
                events,
                updated_at: Utc::now(),
                expected_delivery: None,
                rate_limit: None,
            })
        }
        .await;

        page.close().await;
        outcome
    }
}

/// Map definitive page messages to the error taxonomy; None means the page
/// holds tracking data.
fn classify_page_text(body_text: &str, tracking_number: &str) -> Option<CarrierError> {
    let lower = body_text.to_lowercase();

    if lower.contains(BOT_BLOCK_PHRASE) || lower.contains("captcha") {
        return Some(CarrierError::bot_detected(
            "FedEx declined to serve tracking results to this client; the request was \
             flagged as automated and will be retried later",
        ));
    }

    if lower.contains("tracking number not found")
        || lower.contains("couldn't find any results")
        || lower.contains("no record of this tracking number")
    {
        return Some(CarrierError::not_found(format!(
            "FedEx has no record of {}",
            tracking_number
        )));
    }

    if lower.contains("system is temporarily unavailable")
        || lower.contains("temporarily down")
        || lower.contains("please try again later")
    {
        return Some(CarrierError::server("FedEx tracking is temporarily unavailable"));
    }

    None
}

fn parse_extracted_events(raw: &Value) -> Vec<TrackingActivity> {
    let Some(json_text) = raw.as_str() else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<Vec<Value>>(json_text) else {
        return Vec::new();
    };

    parsed
        .iter()
        .filter_map(|entry| {
            let description = entry["status"].as_str()?.trim().to_string();
            if description.is_empty() {
                return None;
            }
            let location = entry["location"]
                .as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let occurred_at = parse_page_timestamp(
                entry["date"].as_str().unwrap_or_default(),
                entry["time"].as_str().unwrap_or_default(),
            );
            Some(TrackingActivity {
                occurred_at,
                location,
                status: map_status_text(&description),
                description,
            })
        })
        .collect()
}

fn parse_page_timestamp(date: &str, time: &str) -> chrono::DateTime<Utc> {
    // The page renders dates like "1/20/2026" or "Tuesday, 1/20/2026"
    let date_part = date.rsplit(' ').next().unwrap_or(date).trim();
    let date = NaiveDate::parse_from_str(date_part, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y-%m-%d"))
        .unwrap_or_default();

    let time_lower = time.trim().to_lowercase();
    let time = NaiveTime::parse_from_str(&time_lower, "%I:%M %P")
        .or_else(|_| NaiveTime::parse_from_str(&time_lower, "%H:%M"))
        .unwrap_or_default();

    Utc.from_utc_datetime(&NaiveDateTime::new(date, time))
}

#[async_trait]
impl CarrierClient for FedexHeadlessClient {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carriers::CarrierErrorKind;
    use serde_json::json;

    #[test]
    fn test_bot_block_is_distinct_from_not_found() {
        let bot = classify_page_text(
            "Unfortunately we are unable to retrieve your tracking results at this time.",
            "123456789012",
        )
        .unwrap();
        assert_eq!(bot.kind, CarrierErrorKind::BotDetected);
        assert!(bot.retryable);

        let missing =
            classify_page_text("Tracking number not found.", "123456789012").unwrap();
        assert_eq!(missing.kind, CarrierErrorKind::NotFound);
        assert!(!missing.retryable);

        let outage = classify_page_text(
            "Our system is temporarily unavailable. Please try again later.",
            "123456789012",
        )
        .unwrap();
        assert_eq!(outage.kind, CarrierErrorKind::Server);
        assert!(outage.retryable);
    }

    #[test]
    fn test_tracking_page_passes_classification() {
        let page = "Delivered\nTuesday 1/20/2026\nMemphis, TN";
        assert!(classify_page_text(page, "123456789012").is_none());
    }

    #[test]
    fn test_parse_extracted_events() {
        let raw = json!(
            r#"[{"date":"1/20/2026","time":"2:30 pm","status":"Delivered","location":"Memphis, TN"},
                {"date":"1/19/2026","time":"11:02 am","status":"In transit","location":"Nashville, TN"}]"#
        );
        let events = parse_extracted_events(&raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, TrackingStatus::Delivered);
        assert_eq!(events[0].location.as_deref(), Some("Memphis, TN"));
        assert!(events[0].occurred_at > events[1].occurred_at);
    }

    #[test]
    fn test_parse_extracted_events_tolerates_junk() {
        assert!(parse_extracted_events(&json!(null)).is_empty());
        assert!(parse_extracted_events(&json!("not json")).is_empty());
        assert!(parse_extracted_events(&json!("[]")).is_empty());
    }
}
