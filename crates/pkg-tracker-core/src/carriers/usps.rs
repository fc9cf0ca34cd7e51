//! USPS tracking via the Web Tools TrackV2 API (simple key, XML payload).
//!
//! USPS accepts up to 10 tracking numbers per request; each number gets its
//! own `TrackInfo` block and its own error, so one bad number never poisons
//! the rest of the batch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tracing::debug;

use crate::models::{CarrierCode, TrackingStatus};

use super::{
    map_status_text, validation, CarrierClient, CarrierError, TrackOutcome, TrackRequest,
    TrackResponse, TrackResult, TrackingActivity, API_TIMEOUT_SECS,
};

const DEFAULT_BASE_URL: &str = "https://secure.shippingapis.com/ShippingAPI.dll";

/// Maximum tracking numbers USPS accepts in a single TrackV2 call
pub const MAX_BATCH: usize = 10;

/// USPS API adapter.
pub struct UspsApiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl UspsApiClient {
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

    fn build_request_xml(&self, tracking_numbers: &[&str]) -> String {
        let mut xml = format!(
            r#"<TrackFieldRequest USERID="{}"><Revision>1</Revision><ClientIp>127.0.0.1</ClientIp><SourceId>pkg-tracker</SourceId>"#,
            xml_escape(&self.api_key)
        );
        for number in tracking_numbers {
            xml.push_str(&format!(r#"<TrackID ID="{}"></TrackID>"#, xml_escape(number)));
        }
        xml.push_str("</TrackFieldRequest>");
        xml
    }
}

#[async_trait]
impl CarrierClient for UspsApiClient {
    fn validate(&self, tracking: &str) -> bool {
        validation::validate(CarrierCode::Usps, tracking)
    }

    async fn track(&self, request: &TrackRequest) -> Result<TrackResponse, CarrierError> {
        if request.tracking_numbers.len() > MAX_BATCH {
            return Err(CarrierError::invalid_format(format!(
                "USPS accepts at most {} tracking numbers per call",
                MAX_BATCH
            )));
        }

        // Structurally invalid numbers are settled locally; only the valid
        // remainder goes over the wire.
        let mut results: Vec<TrackOutcome> = Vec::with_capacity(request.tracking_numbers.len());
        let mut wire_numbers: Vec<&str> = Vec::new();
        for number in &request.tracking_numbers {
            let placeholder = if self.validate(number) {
                wire_numbers.push(number.as_str());
                // Overwritten from the response; stays only if USPS omits the block
                CarrierError::server(format!("USPS returned no data for {}", number))
            } else {
                CarrierError::invalid_format(format!("{} is not a USPS tracking number", number))
            };
            results.push(TrackOutcome {
                tracking_number: number.clone(),
                result: Err(placeholder),
            });
        }

        if wire_numbers.is_empty() {
            return Ok(TrackResponse {
                results,
                rate_limit: None,
            });
        }

        debug!(count = wire_numbers.len(), "USPS track request");

        let xml = self.build_request_xml(&wire_numbers);
        let response = self
            .http
            .get(&self.base_url)
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .query(&[("API", "TrackV2"), ("XML", xml.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            if status.is_server_error() {
                return Err(CarrierError::server(format!("USPS returned {}", status)));
            }
            return Err(CarrierError::network(format!("USPS returned {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CarrierError::server(format!("USPS response unreadable: {}", e)))?;

        // A top-level <Error> outside any TrackInfo fails the whole call
        if !body.contains("<TrackInfo") {
            if let Some(error_block) = xml_block(&body, "Error") {
                let description = xml_text(&error_block, "Description").unwrap_or_default();
                if description.to_lowercase().contains("authorization") {
                    return Err(CarrierError::auth(format!("USPS: {}", description)));
                }
                return Err(CarrierError::server(format!("USPS: {}", description)));
            }
            return Err(CarrierError::server("USPS returned no TrackInfo blocks"));
        }

        for block in xml_blocks(&body, "TrackInfo") {
            let id = match attribute(&block, "ID") {
                Some(id) => id,
                None => continue,
            };
            let outcome = parse_track_info(&block);
            if let Some(slot) = results.iter_mut().find(|r| r.tracking_number == id) {
                slot.result = outcome;
            }
        }

        Ok(TrackResponse {
            results,
            rate_limit: None,
        })
    }

    fn carrier(&self) -> CarrierCode {
        CarrierCode::Usps
    }
}

fn parse_track_info(block: &str) -> Result<TrackResult, CarrierError> {
    if let Some(error_block) = xml_block(block, "Error") {
        let description =
            xml_text(&error_block, "Description").unwrap_or_else(|| "tracking failed".to_string());
        let lower = description.to_lowercase();
        if lower.contains("could not locate") || lower.contains("not yet in the system") {
            return Err(CarrierError::not_found(format!("USPS: {}", description)));
        }
        return Err(CarrierError::server(format!("USPS: {}", description)));
    }

    let mut events = Vec::new();
    if let Some(summary) = xml_block(block, "TrackSummary") {
        if let Some(event) = parse_event(&summary) {
            events.push(event);
        }
    }
    for detail in xml_blocks(block, "TrackDetail") {
        if let Some(event) = parse_event(&detail) {
            events.push(event);
        }
    }

    let status = events
        .first()
        .map(|e| e.status)
        .unwrap_or(TrackingStatus::Pending);

    let expected_delivery = xml_text(block, "ExpectedDeliveryDate")
        .as_deref()
        .and_then(parse_usps_date);

    Ok(TrackResult {
        status,
        events,
        updated_at: Utc::now(),
        expected_delivery,
        rate_limit: None,
    })
}

fn parse_event(block: &str) -> Option<TrackingActivity> {
    let description = xml_text(block, "Event")?;
    let date = xml_text(block, "EventDate").unwrap_or_default();
    let time = xml_text(block, "EventTime").unwrap_or_default();

    let city = xml_text(block, "EventCity").unwrap_or_default();
    let state = xml_text(block, "EventState").unwrap_or_default();
    let location = match (city.is_empty(), state.is_empty()) {
        (false, false) => Some(format!("{}, {}", city, state)),
        (false, true) => Some(city),
        (true, false) => Some(state),
        (true, true) => None,
    };

    Some(TrackingActivity {
        occurred_at: parse_usps_timestamp(&date, &time),
        location,
        status: map_status_text(&description),
        description,
    })
}

fn parse_usps_date(date: &str) -> Option<NaiveDate> {
    // USPS writes "January 19, 2026"; day may be unpadded
    NaiveDate::parse_from_str(date.trim(), "%B %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(date.trim(), "%B %e, %Y"))
        .ok()
}

fn parse_usps_timestamp(date: &str, time: &str) -> DateTime<Utc> {
    let date = parse_usps_date(date).unwrap_or_default();
    let time = NaiveTime::parse_from_str(&time.trim().to_lowercase(), "%I:%M %P")
        .or_else(|_| NaiveTime::parse_from_str(&time.trim().to_lowercase(), "%l:%M %P"))
        .unwrap_or_default();
    Utc.from_utc_datetime(&NaiveDateTime::new(date, time))
}

// Minimal XML helpers; TrackV2 responses are flat enough that tag scanning
// with entity unescaping covers the format.

fn xml_blocks(source: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start..];
        // Reject partial tag-name matches such as <TrackInfoX>
        match after.as_bytes().get(open.len()) {
            Some(b' ') | Some(b'>') => {}
            _ => {
                rest = &rest[start + open.len()..];
                continue;
            }
        }
        let Some(end) = after.find(&close) else { break };
        blocks.push(after[..end + close.len()].to_string());
        rest = &after[end + close.len()..];
    }
    blocks
}

fn xml_block(source: &str, tag: &str) -> Option<String> {
    xml_blocks(source, tag).into_iter().next()
}

fn xml_text(source: &str, tag: &str) -> Option<String> {
    let block = xml_block(source, tag)?;
    let inner_start = block.find('>')? + 1;
    let inner_end = block.rfind("</")?;
    if inner_start > inner_end {
        return None;
    }
    let text = xml_unescape(block[inner_start..inner_end].trim());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn attribute(block: &str, name: &str) -> Option<String> {
    let tag_end = block.find('>')?;
    let header = &block[..tag_end];
    let marker = format!("{}=\"", name);
    let start = header.find(&marker)? + marker.len();
    let end = header[start..].find('"')? + start;
    Some(xml_unescape(&header[start..end]))
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carriers::CarrierErrorKind;

    const GOOD: &str = "9400111899223100000000";
    const ALSO_GOOD: &str = "9205511899223100000000";

    fn sample_response() -> String {
        format!(
            r#"<TrackResponse>
                <TrackInfo ID="{GOOD}">
                    <TrackSummary>
                        <EventDate>January 20, 2026</EventDate>
                        <EventTime>2:30 pm</EventTime>
                        <Event>Delivered, In/At Mailbox</Event>
                        <EventCity>PORTLAND</EventCity>
                        <EventState>OR</EventState>
                    </TrackSummary>
                    <TrackDetail>
                        <EventDate>January 19, 2026</EventDate>
                        <EventTime>6:10 am</EventTime>
                        <Event>Out for Delivery</Event>
                        <EventCity>PORTLAND</EventCity>
                        <EventState>OR</EventState>
                    </TrackDetail>
                </TrackInfo>
                <TrackInfo ID="{ALSO_GOOD}">
                    <Error>
                        <Description>A status update is not yet available, could not locate.</Description>
                    </Error>
                </TrackInfo>
            </TrackResponse>"#
        )
    }

    #[test]
    fn test_parse_track_info_blocks() {
        let body = sample_response();
        let blocks = xml_blocks(&body, "TrackInfo");
        assert_eq!(blocks.len(), 2);

        let ok = parse_track_info(&blocks[0]).unwrap();
        assert_eq!(ok.status, TrackingStatus::Delivered);
        assert_eq!(ok.events.len(), 2);
        assert_eq!(ok.events[0].location.as_deref(), Some("PORTLAND, OR"));
        assert_eq!(ok.events[1].status, TrackingStatus::OutForDelivery);

        let err = parse_track_info(&blocks[1]).unwrap_err();
        assert_eq!(err.kind, CarrierErrorKind::NotFound);
    }

    #[test]
    fn test_attribute_extraction() {
        let body = sample_response();
        let blocks = xml_blocks(&body, "TrackInfo");
        assert_eq!(attribute(&blocks[0], "ID").as_deref(), Some(GOOD));
        assert_eq!(attribute(&blocks[1], "ID").as_deref(), Some(ALSO_GOOD));
    }

    #[test]
    fn test_usps_timestamp_parsing() {
        let ts = parse_usps_timestamp("January 20, 2026", "2:30 pm");
        assert_eq!(ts.format("%Y-%m-%d %H:%M").to_string(), "2026-01-20 14:30");
    }

    #[tokio::test]
    async fn test_invalid_numbers_fail_locally() {
        let client = UspsApiClient::new("test-key");
        let response = client
            .track(&TrackRequest::batch(vec!["INVALID".to_string()]))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        let err = response.results[0].result.as_ref().unwrap_err();
        assert_eq!(err.kind, CarrierErrorKind::InvalidFormat);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_batch_size_cap() {
        let client = UspsApiClient::new("test-key");
        let numbers: Vec<String> = (0..11).map(|i| format!("94001118992231000000{:02}", i)).collect();
        let err = client.track(&TrackRequest::batch(numbers)).await.unwrap_err();
        assert_eq!(err.kind, CarrierErrorKind::InvalidFormat);
    }

    #[test]
    fn test_xml_escape_round_trip() {
        let raw = r#"a&b<c>"d""#;
        assert_eq!(xml_unescape(&xml_escape(raw)), raw);
    }
}
