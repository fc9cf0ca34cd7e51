//! Admin controls for the tracking updater.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use pkg_tracker_core::UpdaterStatus;

use crate::state::AppState;

pub async fn updater_status(State(state): State<AppState>) -> Json<UpdaterStatus> {
    Json(state.updater.status())
}

pub async fn pause_updater(State(state): State<AppState>) -> StatusCode {
    state.updater.pause();
    StatusCode::NO_CONTENT
}

pub async fn resume_updater(State(state): State<AppState>) -> StatusCode {
    state.updater.resume();
    StatusCode::NO_CONTENT
}
