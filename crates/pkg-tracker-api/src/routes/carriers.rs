use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::state::AppState;

/// List active carriers.
pub async fn list_carriers(State(state): State<AppState>) -> ApiResult<Json<Vec<Value>>> {
    let carriers = state.store.carriers.list_active().await?;
    Ok(Json(
        carriers
            .into_iter()
            .map(|c| {
                json!({
                    "code": c.code,
                    "name": c.name,
                    "active": c.active,
                })
            })
            .collect(),
    ))
}
