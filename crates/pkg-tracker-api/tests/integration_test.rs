//! End-to-end tests driving the router with stubbed carriers.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use pkg_tracker_core::carriers::{
    CarrierClient, CarrierError, ClientFactory, TrackOutcome, TrackRequest, TrackResponse,
    TrackResult, TrackingActivity,
};
use pkg_tracker_core::config::{AdminConfig, CarrierCredentials, ServerConfig, UpdateConfig};
use pkg_tracker_core::db::migrate::auto_migrate;
use pkg_tracker_core::models::{CarrierCode, EmailStatus, TrackingStatus};
use pkg_tracker_core::refresh::RefreshGate;
use pkg_tracker_core::repository::{NewProcessedEmail, Store};
use pkg_tracker_core::updater::TrackingUpdater;
use pkg_tracker_api::{create_router, AppState};

const ADMIN_KEY: &str = "test-admin-key";

/// Stub that answers every number with one fixed origin-scan event.
struct StubCarrier {
    carrier: CarrierCode,
    response: Result<TrackResult, CarrierError>,
}

impl StubCarrier {
    fn origin_scan(carrier: CarrierCode) -> Self {
        Self {
            carrier,
            response: Ok(TrackResult {
                status: TrackingStatus::InTransit,
                events: vec![TrackingActivity {
                    occurred_at: Utc.with_ymd_and_hms(2026, 1, 20, 14, 30, 0).unwrap(),
                    location: Some("Louisville, KY".into()),
                    status: TrackingStatus::InTransit,
                    description: "Origin scan".into(),
                }],
                updated_at: Utc::now(),
                expected_delivery: None,
                rate_limit: None,
            }),
        }
    }

    fn failing(carrier: CarrierCode, error: CarrierError) -> Self {
        Self {
            carrier,
            response: Err(error),
        }
    }
}

#[async_trait]
impl CarrierClient for StubCarrier {
    fn validate(&self, tracking: &str) -> bool {
        !tracking.is_empty()
    }

    async fn track(&self, request: &TrackRequest) -> Result<TrackResponse, CarrierError> {
        Ok(TrackResponse {
            results: request
                .tracking_numbers
                .iter()
                .map(|n| TrackOutcome {
                    tracking_number: n.clone(),
                    result: self.response.clone(),
                })
                .collect(),
            rate_limit: None,
        })
    }

    fn carrier(&self) -> CarrierCode {
        self.carrier
    }
}

async fn test_app() -> (Router, Store, Arc<ClientFactory>) {
    let pool = pkg_tracker_core::create_memory_pool().await.unwrap();
    auto_migrate(&pool).await.unwrap();
    let store = Store::new(pool);

    let factory = Arc::new(ClientFactory::new(CarrierCredentials::default()));
    let gate = Arc::new(RefreshGate::new(store.clone(), factory.clone(), 300, false));
    let updater = Arc::new(TrackingUpdater::new(
        store.clone(),
        gate.clone(),
        factory.clone(),
        UpdateConfig::default(),
    ));

    let admin = AdminConfig {
        api_key: ADMIN_KEY.to_string(),
        auth_disabled: false,
    };
    let state = AppState::new(store.clone(), factory.clone(), gate, updater, admin);

    let server = ServerConfig::default();
    (create_router(state, &server), store, factory)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_and_carriers() {
    let (router, _, _) = test_app().await;

    let (status, body) = send(&router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&router, get("/api/carriers")).await;
    assert_eq!(status, StatusCode::OK);
    let codes: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert!(codes.contains(&"ups"));
    assert!(!codes.contains(&"dhl"), "DHL seeds inactive");
}

#[tokio::test]
async fn test_create_then_manual_refresh_flow() {
    let (router, _, factory) = test_app().await;
    factory.set_client(
        CarrierCode::Ups,
        Arc::new(StubCarrier::origin_scan(CarrierCode::Ups)),
    );

    // Create
    let (status, body) = send(
        &router,
        post_json(
            "/api/shipments",
            json!({"tracking_number": "1Z999AA10123456784", "carrier": "ups", "description": "book"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], 1);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["is_delivered"], false);

    // First refresh: fresh carrier call, one event lands
    let (status, body) = send(&router, post_json("/api/shipments/1/refresh", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events_added"], 1);
    assert_eq!(body["total_events"], 1);
    assert_eq!(body["cache_status"], "fresh");
    assert_eq!(body["events"][0]["description"], "Origin scan");

    // Second refresh inside the cooldown without force: refused
    let (status, body) = send(&router, post_json("/api/shipments/1/refresh", json!({}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "COOLDOWN");
    assert!(body["retry_after_secs"].as_i64().unwrap() > 0);

    // Forced refresh bypasses cooldown and cache; the same event deduplicates
    let (status, body) = send(
        &router,
        post_json("/api/shipments/1/refresh?force=true", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cache_status"], "forced");
    assert_eq!(body["events_added"], 0);
    assert_eq!(body["total_events"], 1);
    assert!(body["previous_cache_age"].is_number());
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let (router, _, _) = test_app().await;
    let request =
        json!({"tracking_number": "1Z999AA10123456784", "carrier": "ups", "description": ""});

    let (status, _) = send(&router, post_json("/api/shipments", request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&router, post_json("/api/shipments", request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE");
}

#[tokio::test]
async fn test_invalid_carrier_rejected() {
    let (router, _, _) = test_app().await;
    let (status, _) = send(
        &router,
        post_json(
            "/api/shipments",
            json!({"tracking_number": "X1", "carrier": "pigeon"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_fedex_bot_detection_is_distinct() {
    let (router, _, factory) = test_app().await;
    factory.set_client(
        CarrierCode::Fedex,
        Arc::new(StubCarrier::failing(
            CarrierCode::Fedex,
            CarrierError::bot_detected(
                "FedEx declined to serve tracking results to this client",
            ),
        )),
    );

    send(
        &router,
        post_json(
            "/api/shipments",
            json!({"tracking_number": "123456789012", "carrier": "fedex"}),
        ),
    )
    .await;

    let (status, body) = send(&router, post_json("/api/shipments/1/refresh", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "BOT_DETECTED");
    assert_ne!(body["code"], "NOT_FOUND");
    assert_ne!(body["code"], "SERVER_ERROR");
}

#[tokio::test]
async fn test_amazon_delegation_refreshes_via_ups() {
    let (router, store, factory) = test_app().await;
    factory.set_client(
        CarrierCode::Ups,
        Arc::new(StubCarrier::origin_scan(CarrierCode::Ups)),
    );

    let (status, body) = send(
        &router,
        post_json(
            "/api/shipments",
            json!({
                "tracking_number": "113-1234567-1234567",
                "carrier": "amazon",
                "amazon_order_number": "113-1234567-1234567",
                "delegated_carrier": "ups",
                "delegated_tracking_number": "1Z999AA10123456784"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let amazon_id = body["id"].as_i64().unwrap();

    let (status, body) = send(
        &router,
        post_json(&format!("/api/shipments/{}/refresh", amazon_id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events_added"], 1);

    // Events live under the Amazon shipment, not a separate record
    let events = store.events.list_for_shipment(amazon_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(store.shipments.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_cascades_back_to_clean_state() {
    let (router, store, factory) = test_app().await;
    factory.set_client(
        CarrierCode::Ups,
        Arc::new(StubCarrier::origin_scan(CarrierCode::Ups)),
    );

    send(
        &router,
        post_json(
            "/api/shipments",
            json!({"tracking_number": "1Z999AA10123456784", "carrier": "ups"}),
        ),
    )
    .await;
    send(&router, post_json("/api/shipments/1/refresh", json!({}))).await;

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/shipments/1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert!(store.shipments.list().await.unwrap().is_empty());
    assert_eq!(store.events.count_for_shipment(1).await.unwrap(), 0);
    assert!(store.cache.get(1).await.unwrap().is_none());

    let (status, _) = send(&router, get("/api/shipments/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_email_links_and_body() {
    let (router, store, _) = test_app().await;

    send(
        &router,
        post_json(
            "/api/shipments",
            json!({"tracking_number": "1Z999AA10123456784", "carrier": "ups"}),
        ),
    )
    .await;

    let email = store
        .emails
        .record(&NewProcessedEmail {
            provider_message_id: "msg-1".into(),
            provider_thread_id: Some("thread-1".into()),
            from_address: "ship-confirm@amazon.com".into(),
            subject: "Shipped".into(),
            message_date: Some(Utc::now()),
            internal_timestamp: Utc::now(),
            body_text: Some("UPS tracking 1Z999AA10123456784".into()),
            body_html: None,
            body_compressed: None,
            scan_method: "time-based".into(),
            status: EmailStatus::Processed,
            tracking_numbers: None,
            error_message: None,
        })
        .await
        .unwrap();
    store
        .emails
        .upsert_thread("thread-1", "Shipped", "ship-confirm@amazon.com", Some(Utc::now()))
        .await
        .unwrap();

    // Manual link
    let (status, body) = send(
        &router,
        post_json(&format!("/api/emails/{}/link/1", email.id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["link_type"], "manual");

    // Linking twice conflicts
    let (status, _) = send(
        &router,
        post_json(&format!("/api/emails/{}/link/1", email.id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The shipment now lists the email
    let (status, body) = send(&router, get("/api/shipments/1/emails")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Thread and body lookups
    let (status, body) = send(&router, get("/api/emails/thread-1/thread")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&router, get(&format!("/api/emails/{}/body", email.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["text"].as_str().unwrap().contains("1Z999AA10123456784"));

    // Unlink, then the second unlink is a 404
    let unlink = |uri: String| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&router, unlink(format!("/api/emails/{}/link/1", email.id))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, unlink(format!("/api/emails/{}/link/1", email.id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pruned_body_is_gone() {
    let (router, store, _) = test_app().await;

    let email = store
        .emails
        .record(&NewProcessedEmail {
            provider_message_id: "msg-old".into(),
            provider_thread_id: None,
            from_address: "a@b.com".into(),
            subject: "old".into(),
            message_date: None,
            internal_timestamp: Utc::now() - chrono::Duration::days(120),
            body_text: Some("old body".into()),
            body_html: None,
            body_compressed: None,
            scan_method: "time-based".into(),
            status: EmailStatus::Processed,
            tracking_numbers: None,
            error_message: None,
        })
        .await
        .unwrap();
    store
        .emails
        .prune_bodies(Utc::now() - chrono::Duration::days(90))
        .await
        .unwrap();

    let (status, body) = send(&router, get(&format!("/api/emails/{}/body", email.id))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "BODY_PRUNED");
}

#[tokio::test]
async fn test_admin_routes_require_bearer_key() {
    let (router, _, _) = test_app().await;

    let (status, _) = send(&router, get("/api/admin/tracking-updater/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authed = Request::builder()
        .uri("/api/admin/tracking-updater/status")
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, authed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], false);

    let pause = Request::builder()
        .method("POST")
        .uri("/api/admin/tracking-updater/pause")
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, pause).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let authed = Request::builder()
        .uri("/api/admin/tracking-updater/status")
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&router, authed).await;
    assert_eq!(body["paused"], true);
}

#[tokio::test]
async fn test_dashboard_stats() {
    let (router, store, factory) = test_app().await;
    factory.set_client(
        CarrierCode::Ups,
        Arc::new(StubCarrier::origin_scan(CarrierCode::Ups)),
    );

    send(
        &router,
        post_json(
            "/api/shipments",
            json!({"tracking_number": "1Z999AA10123456784", "carrier": "ups"}),
        ),
    )
    .await;
    send(&router, post_json("/api/shipments/1/refresh", json!({}))).await;

    // Mark a second one delivered directly through the store
    store
        .shipments
        .create(&pkg_tracker_core::models::CreateShipmentRequest {
            tracking_number: "9400111899223100000000".into(),
            carrier: "usps".into(),
            description: String::new(),
            amazon_order_number: None,
            delegated_carrier: None,
            delegated_tracking_number: None,
            is_amazon_logistics: false,
        })
        .await
        .unwrap();
    store
        .events
        .merge_events(
            2,
            &[TrackingActivity {
                occurred_at: Utc::now(),
                location: None,
                status: TrackingStatus::Delivered,
                description: "Delivered".into(),
            }],
            TrackingStatus::Delivered,
            None,
        )
        .await
        .unwrap();

    let (status, body) = send(&router, get("/api/dashboard/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_shipments"], 2);
    assert_eq!(body["in_transit"], 1);
    assert_eq!(body["delivered"], 1);
}
