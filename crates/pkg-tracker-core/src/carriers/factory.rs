//! Adapter selection.
//!
//! For a given carrier the factory picks, in order: the official API when
//! credentials are configured, the headless browser where the carrier demands
//! one (FedEx), and the scraping transport otherwise. Adapter instances are
//! cached per carrier; a configuration change takes effect by building a new
//! factory at reload, never mid-request.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::CarrierCredentials;
use crate::models::CarrierCode;

use super::amazon::AmazonClient;
use super::browser::{Browser, BrowserConfig};
use super::dhl::DhlApiClient;
use super::fedex::FedexApiClient;
use super::headless::FedexHeadlessClient;
use super::scrape::ScrapeClient;
use super::ups::UpsApiClient;
use super::usps::UspsApiClient;
use super::{CarrierClient, CarrierError, TrackRequest, TrackResponse, TrackResult};

/// Resolution of an Amazon shipment's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AmazonRoute {
    Delegated(CarrierCode, String),
    EmailOnly,
}

/// Shipment fields the factory needs to route a tracking call. Borrowing the
/// whole Shipment would drag the store model into this layer.
#[derive(Debug, Clone)]
pub struct TrackTarget {
    pub carrier: CarrierCode,
    pub tracking_number: String,
    pub delegated_carrier: Option<String>,
    pub delegated_tracking_number: Option<String>,
}

impl TrackTarget {
    pub fn new(carrier: CarrierCode, tracking_number: impl Into<String>) -> Self {
        Self {
            carrier,
            tracking_number: tracking_number.into(),
            delegated_carrier: None,
            delegated_tracking_number: None,
        }
    }

    fn amazon_route(&self) -> AmazonRoute {
        let delegated = self
            .delegated_carrier
            .as_deref()
            .and_then(|c| c.parse::<CarrierCode>().ok())
            .filter(|c| *c != CarrierCode::Amazon)
            .zip(self.delegated_tracking_number.clone().filter(|t| !t.is_empty()));
        match delegated {
            Some((carrier, tracking)) => AmazonRoute::Delegated(carrier, tracking),
            None => AmazonRoute::EmailOnly,
        }
    }
}

impl From<&crate::models::Shipment> for TrackTarget {
    fn from(shipment: &crate::models::Shipment) -> Self {
        Self {
            carrier: shipment.carrier,
            tracking_number: shipment.tracking_number.clone(),
            delegated_carrier: shipment.delegated_carrier.clone(),
            delegated_tracking_number: shipment.delegated_tracking_number.clone(),
        }
    }
}

/// Carrier client factory.
pub struct ClientFactory {
    credentials: CarrierCredentials,
    browser: Arc<Browser>,
    clients: DashMap<(CarrierCode, bool), Arc<dyn CarrierClient>>,
}

impl ClientFactory {
    pub fn new(credentials: CarrierCredentials) -> Self {
        Self::with_browser_config(credentials, BrowserConfig::default())
    }

    pub fn with_browser_config(credentials: CarrierCredentials, browser: BrowserConfig) -> Self {
        Self {
            credentials,
            browser: Arc::new(Browser::new(browser)),
            clients: DashMap::new(),
        }
    }

    /// The client for a carrier. `interactive` only changes the FedEx
    /// headless deadline; every other adapter is shared between both paths.
    pub fn client_for(&self, carrier: CarrierCode, interactive: bool) -> Arc<dyn CarrierClient> {
        // Only the FedEx headless transport differs by path
        let key_interactive =
            interactive && carrier == CarrierCode::Fedex && !self.has_api_credentials(carrier);
        let key = (carrier, key_interactive);

        if let Some(client) = self.clients.get(&key) {
            return client.clone();
        }

        let client = self.build(carrier, key_interactive);
        self.clients.insert(key, client.clone());
        client
    }

    fn has_api_credentials(&self, carrier: CarrierCode) -> bool {
        match carrier {
            CarrierCode::Ups => {
                !self.credentials.ups.client_id.is_empty()
                    && !self.credentials.ups.client_secret.is_empty()
            }
            CarrierCode::Usps => !self.credentials.usps.api_key.is_empty(),
            CarrierCode::Fedex => {
                !self.credentials.fedex.client_id.is_empty()
                    && !self.credentials.fedex.client_secret.is_empty()
            }
            CarrierCode::Dhl => !self.credentials.dhl.api_key.is_empty(),
            CarrierCode::Amazon => false,
        }
    }

    fn build(&self, carrier: CarrierCode, interactive: bool) -> Arc<dyn CarrierClient> {
        let transport;
        let client: Arc<dyn CarrierClient> = match carrier {
            CarrierCode::Amazon => {
                transport = "email-only";
                Arc::new(AmazonClient::new())
            }
            carrier if self.has_api_credentials(carrier) => {
                transport = "api";
                match carrier {
                    CarrierCode::Ups => Arc::new(UpsApiClient::new(
                        &self.credentials.ups.client_id,
                        &self.credentials.ups.client_secret,
                    )),
                    CarrierCode::Usps => {
                        Arc::new(UspsApiClient::new(&self.credentials.usps.api_key))
                    }
                    CarrierCode::Fedex => Arc::new(FedexApiClient::new(
                        &self.credentials.fedex.client_id,
                        &self.credentials.fedex.client_secret,
                        &self.credentials.fedex.api_url,
                    )),
                    CarrierCode::Dhl => Arc::new(DhlApiClient::new(&self.credentials.dhl.api_key)),
                    CarrierCode::Amazon => unreachable!(),
                }
            }
            CarrierCode::Fedex => {
                // FedEx without credentials only yields data to a browser
                transport = "headless";
                let headless = FedexHeadlessClient::with_browser(self.browser.clone());
                if interactive {
                    Arc::new(headless.interactive())
                } else {
                    Arc::new(headless)
                }
            }
            carrier => {
                transport = "scrape";
                Arc::new(ScrapeClient::new(carrier))
            }
        };

        info!(carrier = %carrier, transport, "carrier client initialized");
        client
    }

    /// Track a shipment, resolving Amazon delegation first. Events for a
    /// delegated shipment are reported under the Amazon shipment itself.
    pub async fn track_target(
        &self,
        target: &TrackTarget,
        interactive: bool,
    ) -> Result<TrackResult, CarrierError> {
        if target.carrier == CarrierCode::Amazon {
            return match target.amazon_route() {
                AmazonRoute::Delegated(carrier, tracking) => {
                    let client = self.client_for(carrier, interactive);
                    client
                        .track(&TrackRequest::single(tracking))
                        .await?
                        .into_single()
                }
                AmazonRoute::EmailOnly => Ok(TrackResult::empty()),
            };
        }

        let client = self.client_for(target.carrier, interactive);
        client
            .track(&TrackRequest::single(target.tracking_number.clone()))
            .await?
            .into_single()
    }

    /// Batch entry point used by the updater's USPS sweep
    pub async fn track_batch(
        &self,
        carrier: CarrierCode,
        tracking_numbers: Vec<String>,
    ) -> Result<TrackResponse, CarrierError> {
        let client = self.client_for(carrier, false);
        client.track(&TrackRequest::batch(tracking_numbers)).await
    }

    /// Whether any carrier's format validation accepts the number
    pub fn validate(&self, carrier: CarrierCode, tracking: &str) -> bool {
        super::validation::validate(carrier, tracking)
    }

    /// Replace the cached client for a carrier on both paths. Tests use this
    /// to stub carriers without touching the network.
    pub fn set_client(&self, carrier: CarrierCode, client: Arc<dyn CarrierClient>) {
        self.clients.insert((carrier, false), client.clone());
        self.clients.insert((carrier, true), client);
    }

    /// Release transport resources (the shared browser process)
    pub async fn shutdown(&self) {
        self.browser.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CarrierCredentials;

    fn credentials_with_ups() -> CarrierCredentials {
        let mut credentials = CarrierCredentials::default();
        credentials.ups.client_id = "id".into();
        credentials.ups.client_secret = "secret".into();
        credentials
    }

    #[test]
    fn test_clients_are_cached_per_carrier() {
        let factory = ClientFactory::new(credentials_with_ups());
        let a = factory.client_for(CarrierCode::Ups, false);
        let b = factory.client_for(CarrierCode::Ups, true);
        // Interactive flag is irrelevant outside FedEx headless
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_fedex_without_credentials_goes_headless_per_path() {
        let factory = ClientFactory::new(CarrierCredentials::default());
        let batch = factory.client_for(CarrierCode::Fedex, false);
        let interactive = factory.client_for(CarrierCode::Fedex, true);
        assert!(!Arc::ptr_eq(&batch, &interactive));
        assert_eq!(batch.carrier(), CarrierCode::Fedex);
    }

    #[test]
    fn test_amazon_route_resolution() {
        let mut target = TrackTarget::new(CarrierCode::Amazon, "113-1234567-1234567");
        assert_eq!(target.amazon_route(), AmazonRoute::EmailOnly);

        target.delegated_carrier = Some("ups".into());
        target.delegated_tracking_number = Some("1Z999AA10123456784".into());
        assert_eq!(
            target.amazon_route(),
            AmazonRoute::Delegated(CarrierCode::Ups, "1Z999AA10123456784".into())
        );

        // A self-referential delegation must not recurse
        target.delegated_carrier = Some("amazon".into());
        assert_eq!(target.amazon_route(), AmazonRoute::EmailOnly);
    }

    #[tokio::test]
    async fn test_amazon_email_only_tracks_benignly() {
        let factory = ClientFactory::new(CarrierCredentials::default());
        let target = TrackTarget::new(CarrierCode::Amazon, "TBA123456789012");
        let result = factory.track_target(&target, false).await.unwrap();
        assert!(result.events.is_empty());
    }
}
