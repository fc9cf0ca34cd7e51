//! Scraping fallback: classic HTTP + HTML text extraction.
//!
//! Used when a carrier has no configured API credentials. Scraped pages give
//! far less structure than the APIs, so results carry a status plus whatever
//! event lines can be recovered from the page text.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::models::{CarrierCode, TrackingStatus};

use super::{
    map_status_text, validation, CarrierClient, CarrierError, TrackOutcome, TrackRequest,
    TrackResponse, TrackResult, TrackingActivity, SCRAPE_TIMEOUT_SECS,
};

/// HTML scraping adapter, parameterized by carrier.
pub struct ScrapeClient {
    http: reqwest::Client,
    carrier: CarrierCode,
    url_template: String,
}

impl ScrapeClient {
    pub fn new(carrier: CarrierCode) -> Self {
        let url_template = match carrier {
            CarrierCode::Ups => "https://www.ups.com/track?tracknum={tracking}".to_string(),
            CarrierCode::Usps => {
                "https://tools.usps.com/go/TrackConfirmAction?qtc_tLabels1={tracking}".to_string()
            }
            CarrierCode::Dhl => {
                "https://www.dhl.com/us-en/home/tracking/tracking-parcel.html?tracking-id={tracking}"
                    .to_string()
            }
            CarrierCode::Fedex => {
                "https://www.fedex.com/fedextrack/?trknbr={tracking}".to_string()
            }
            CarrierCode::Amazon => String::new(),
        };
        Self {
            http: reqwest::Client::new(),
            carrier,
            url_template,
        }
    }

    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackResult, CarrierError> {
        if self.url_template.is_empty() {
            return Err(CarrierError::unsupported(format!(
                "no scraping endpoint for {}",
                self.carrier
            )));
        }

        let url = self.url_template.replace("{tracking}", tracking_number);
        debug!(carrier = %self.carrier, tracking_number, "scraping tracking page");

        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(SCRAPE_TIMEOUT_SECS))
            .header(
                "User-Agent",
                "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
            )
            .header("Accept", "text/html,application/xhtml+xml")
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => {
                return Err(CarrierError::not_found(format!(
                    "{} page has no record of {}",
                    self.carrier, tracking_number
                )))
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS | reqwest::StatusCode::FORBIDDEN => {
                return Err(CarrierError::bot_detected(format!(
                    "{} tracking page refused the request",
                    self.carrier
                )))
            }
            s if s.is_server_error() => {
                return Err(CarrierError::server(format!(
                    "{} tracking page returned {}",
                    self.carrier, s
                )))
            }
            s => {
                return Err(CarrierError::server(format!(
                    "{} tracking page returned {}",
                    self.carrier, s
                )))
            }
        }

        let html = response
            .text()
            .await
            .map_err(|e| CarrierError::server(format!("page unreadable: {}", e)))?;

        parse_page(self.carrier, tracking_number, &html)
    }
}

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static SCRIPT_OR_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());

/// Reduce an HTML document to plain text, one line per block element
pub fn html_to_text(html: &str) -> String {
    let stripped = SCRIPT_OR_STYLE.replace_all(html, " ");
    let with_breaks = stripped
        .replace("</tr>", "\n")
        .replace("</td>", "\t")
        .replace("</th>", "\t")
        .replace("</p>", "\n")
        .replace("</div>", "\n")
        .replace("</li>", "\n")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n");
    let text = TAG.replace_all(&with_breaks, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    text.lines()
        .map(|line| WHITESPACE.replace_all(line.trim(), " ").to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_page(
    carrier: CarrierCode,
    tracking_number: &str,
    html: &str,
) -> Result<TrackResult, CarrierError> {
    let text = html_to_text(html);
    let lower = text.to_lowercase();

    if lower.contains("verify you are a human")
        || lower.contains("access denied")
        || lower.contains("captcha")
    {
        return Err(CarrierError::bot_detected(format!(
            "{} tracking page served a bot challenge",
            carrier
        )));
    }

    if lower.contains("could not locate the tracking information")
        || lower.contains("number cannot be found")
        || lower.contains("no record of this")
    {
        return Err(CarrierError::not_found(format!(
            "{} page has no record of {}",
            carrier, tracking_number
        )));
    }

    // Pull the first line that maps to a definite status; scrape results are
    // a summary, not a scan history.
    let mut status = TrackingStatus::Unknown;
    let mut description = String::new();
    for line in text.lines() {
        let mapped = map_status_text(line);
        if mapped != TrackingStatus::Unknown {
            status = mapped;
            description = line.trim().to_string();
            break;
        }
    }

    if status == TrackingStatus::Unknown {
        return Err(CarrierError::server(format!(
            "{} page contained no recognizable status for {}",
            carrier, tracking_number
        )));
    }

    let events = vec![TrackingActivity {
        occurred_at: Utc::now(),
        location: None,
        status,
        description,
    }];

    Ok(TrackResult {
        status,
        events,
        updated_at: Utc::now(),
        expected_delivery: None,
        rate_limit: None,
    })
}

#[async_trait]
impl CarrierClient for ScrapeClient {
    fn validate(&self, tracking: &str) -> bool {
        validation::validate(self.carrier, tracking)
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
        self.carrier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carriers::CarrierErrorKind;

    #[test]
    fn test_html_to_text_preserves_table_rows() {
        let html = "<table><tr><td>Jan 20</td><td>Delivered</td></tr>\
                    <tr><td>Jan 19</td><td>In Transit</td></tr></table>";
        let text = html_to_text(html);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Jan 20"));
        assert!(lines[0].contains("Delivered"));
    }

    #[test]
    fn test_html_to_text_drops_scripts() {
        let html = "<div>Delivered</div><script>var x = 'in transit';</script>";
        let text = html_to_text(html);
        assert!(text.contains("Delivered"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn test_parse_page_finds_status() {
        let html = "<html><body><h1>Tracking</h1><div>Delivered on January 20</div></body></html>";
        let result = parse_page(CarrierCode::Ups, "1Z999AA10123456784", html).unwrap();
        assert_eq!(result.status, TrackingStatus::Delivered);
        assert_eq!(result.events.len(), 1);
    }

    #[test]
    fn test_parse_page_bot_challenge() {
        let html = "<html><body>Please verify you are a human to continue</body></html>";
        let err = parse_page(CarrierCode::Dhl, "1234567890", html).unwrap_err();
        assert_eq!(err.kind, CarrierErrorKind::BotDetected);
        assert!(err.retryable);
    }

    #[test]
    fn test_parse_page_not_found() {
        let html = "<html><body>We could not locate the tracking information.</body></html>";
        let err = parse_page(CarrierCode::Usps, "9400111899223100000000", html).unwrap_err();
        assert_eq!(err.kind, CarrierErrorKind::NotFound);
    }
}
