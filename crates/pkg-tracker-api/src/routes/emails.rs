//! Email surface: linked emails, threads, retained bodies, manual links.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use pkg_tracker_core::email::pipeline::decompress_bodies;
use pkg_tracker_core::models::{EmailShipmentLink, LinkType, ProcessedEmail};
use pkg_tracker_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

/// Actor tag for links created through the API
const API_ACTOR: &str = "api";

pub async fn shipment_emails(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<ProcessedEmail>>> {
    state.store.shipments.get(id).await?;
    Ok(Json(state.store.emails.emails_for_shipment(id).await?))
}

pub async fn thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Vec<ProcessedEmail>>> {
    state
        .store
        .emails
        .get_thread(&thread_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("thread {}", thread_id)))?;
    Ok(Json(state.store.emails.thread_messages(&thread_id).await?))
}

/// Retained body for one email. 410 once retention pruning has taken it.
pub async fn email_body(
    State(state): State<AppState>,
    Path(email_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let email = state.store.emails.get(email_id).await?;

    let (text, html) = match (&email.body_text, &email.body_html, &email.body_compressed) {
        (None, None, Some(blob)) => decompress_bodies(blob)
            .ok_or_else(|| Error::email("stored body blob is unreadable"))?,
        (text, html, _) if text.is_some() || html.is_some() => (text.clone(), html.clone()),
        _ => {
            return Ok((
                StatusCode::GONE,
                Json(json!({
                    "error": "body pruned past the retention horizon",
                    "code": "BODY_PRUNED",
                })),
            ))
        }
    };

    let mut body = json!({ "text": text });
    if let Some(html) = html {
        body["html"] = json!(html);
    }
    Ok((StatusCode::OK, Json(body)))
}

pub async fn create_link(
    State(state): State<AppState>,
    Path((email_id, shipment_id)): Path<(i64, i64)>,
) -> ApiResult<(StatusCode, Json<EmailShipmentLink>)> {
    let email = state.store.emails.get(email_id).await?;
    let shipment = state.store.shipments.get(shipment_id).await?;

    let link = state
        .store
        .emails
        .create_link(
            email.id,
            shipment.id,
            LinkType::Manual,
            &shipment.tracking_number,
            API_ACTOR,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn delete_link(
    State(state): State<AppState>,
    Path((email_id, shipment_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.store.emails.delete_link(email_id, shipment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
