//! Shipment CRUD and the interactive refresh endpoint.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use pkg_tracker_core::models::{CreateShipmentRequest, Shipment, UpdateShipmentRequest};
use pkg_tracker_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_shipments(State(state): State<AppState>) -> ApiResult<Json<Vec<Shipment>>> {
    Ok(Json(state.store.shipments.list().await?))
}

pub async fn create_shipment(
    State(state): State<AppState>,
    Json(request): Json<CreateShipmentRequest>,
) -> ApiResult<(StatusCode, Json<Shipment>)> {
    let shipment = state.store.shipments.create(&request).await?;
    Ok((StatusCode::CREATED, Json(shipment)))
}

pub async fn get_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Shipment>> {
    Ok(Json(state.store.shipments.get(id).await?))
}

pub async fn update_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateShipmentRequest>,
) -> ApiResult<Json<Shipment>> {
    if request.description.len() > 500 {
        return Err(Error::validation("description is limited to 500 characters").into());
    }
    Ok(Json(
        state
            .store
            .shipments
            .update_description(id, &request.description)
            .await?,
    ))
}

pub async fn delete_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.store.shipments.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    // 404 for an unknown shipment, not an empty list
    state.store.shipments.get(id).await?;
    let events = state.store.events.list_for_shipment(id).await?;
    Ok(Json(json!(events)))
}

#[derive(Debug, Deserialize, Default)]
pub struct RefreshQuery {
    #[serde(default)]
    pub force: bool,
}

/// Interactive refresh through the gate. 429 inside the cooldown without
/// `force`; carrier failures surface as 5xx with a distinct code.
pub async fn refresh_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<RefreshQuery>,
) -> ApiResult<Json<Value>> {
    // 404 before touching the gate
    state.store.shipments.get(id).await?;

    let started = Instant::now();
    let outcome = state.gate.refresh(id, query.force, true).await?;
    let refresh_duration = started.elapsed().as_secs_f64();

    let shipment = state.store.shipments.get(id).await?;
    let events = state.store.events.list_for_shipment(id).await?;

    let mut body = json!({
        "shipment_id": id,
        "updated_at": shipment.updated_at,
        "events_added": outcome.events_added,
        "total_events": events.len(),
        "events": events,
        "cache_status": outcome.source.as_str(),
        "refresh_duration": format!("{:.3}s", refresh_duration),
    });
    if let Some(age) = outcome.previous_cache_age_secs {
        body["previous_cache_age"] = json!(age);
    }

    Ok(Json(body))
}
