pub mod admin;
pub mod carriers;
pub mod dashboard;
pub mod emails;
pub mod health;
pub mod shipments;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use pkg_tracker_core::config::ServerConfig;

use crate::middleware::{
    admin_auth_middleware, default_content_type_middleware, security_headers_middleware,
};
use crate::state::AppState;

/// Assemble the full application router: the /api surface plus the SPA
/// static-asset fallback.
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let admin_routes = Router::new()
        .route("/tracking-updater/status", get(admin::updater_status))
        .route("/tracking-updater/pause", post(admin::pause_updater))
        .route("/tracking-updater/resume", post(admin::resume_updater))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    let api_routes = Router::new()
        .route("/health", get(health::health))
        .route("/carriers", get(carriers::list_carriers))
        .route(
            "/shipments",
            get(shipments::list_shipments).post(shipments::create_shipment),
        )
        .route(
            "/shipments/:id",
            get(shipments::get_shipment)
                .put(shipments::update_shipment)
                .delete(shipments::delete_shipment),
        )
        .route("/shipments/:id/events", get(shipments::list_events))
        .route("/shipments/:id/refresh", post(shipments::refresh_shipment))
        .route("/shipments/:id/emails", get(emails::shipment_emails))
        .route("/emails/:thread_id/thread", get(emails::thread_messages))
        .route("/emails/:email_id/body", get(emails::email_body))
        .route(
            "/emails/:email_id/link/:shipment_id",
            post(emails::create_link).delete(emails::delete_link),
        )
        .route("/dashboard/stats", get(dashboard::stats))
        .nest("/admin", admin_routes);

    // Everything outside /api serves the SPA bundle
    let index = format!("{}/index.html", server.static_dir.trim_end_matches('/'));
    let static_assets = ServeDir::new(&server.static_dir).fallback(ServeFile::new(index));

    // Layers run outermost-last: request tracing wraps panic recovery, then
    // CORS, content-type defaulting, and security headers
    Router::new()
        .nest("/api", api_routes)
        .fallback_service(static_assets)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(default_content_type_middleware))
        .layer(cors_layer(server))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Permissive CORS for local development; restricted to the configured
/// origins in production.
fn cors_layer(server: &ServerConfig) -> CorsLayer {
    if server.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
