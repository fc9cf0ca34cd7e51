//! Amazon pseudo-carrier.
//!
//! Amazon has no tracking API. Shipments that delegate to a real carrier are
//! resolved by the factory before any client is invoked; what remains here is
//! the email-only path (Amazon Logistics or unknown delegation), where a
//! refresh legitimately produces no new events rather than an error.

use async_trait::async_trait;

use crate::models::CarrierCode;

use super::{
    validation, CarrierClient, CarrierError, TrackOutcome, TrackRequest, TrackResponse,
    TrackResult,
};

pub struct AmazonClient;

impl AmazonClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AmazonClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CarrierClient for AmazonClient {
    fn validate(&self, tracking: &str) -> bool {
        validation::validate(CarrierCode::Amazon, tracking)
    }

    async fn track(&self, request: &TrackRequest) -> Result<TrackResponse, CarrierError> {
        // Email-only: updates arrive through the mailbox pipeline, so a
        // refresh is a benign no-op with an empty event list.
        let results = request
            .tracking_numbers
            .iter()
            .map(|tracking_number| TrackOutcome {
                tracking_number: tracking_number.clone(),
                result: Ok(TrackResult::empty()),
            })
            .collect();

        Ok(TrackResponse {
            results,
            rate_limit: None,
        })
    }

    fn carrier(&self) -> CarrierCode {
        CarrierCode::Amazon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackingStatus;

    #[tokio::test]
    async fn test_email_only_refresh_is_benign() {
        let client = AmazonClient::new();
        let response = client
            .track(&TrackRequest::single("TBA123456789012"))
            .await
            .unwrap();
        let result = response.results[0].result.as_ref().unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.status, TrackingStatus::Pending);
    }

    #[test]
    fn test_validates_amazon_formats() {
        let client = AmazonClient::new();
        assert!(client.validate("113-1234567-1234567"));
        assert!(client.validate("TBA123456789012"));
        assert!(!client.validate("1Z999AA10123456784"));
    }
}
