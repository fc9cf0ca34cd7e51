use axum::extract::State;
use axum::Json;

use pkg_tracker_core::models::DashboardStats;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<DashboardStats>> {
    Ok(Json(state.store.shipments.dashboard_stats().await?))
}
