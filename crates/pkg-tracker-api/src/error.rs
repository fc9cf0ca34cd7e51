//! Translation of core errors into HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use pkg_tracker_core::Error;

/// Wrapper so core errors can flow out of handlers with `?`.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &error {
            Error::Cooldown { retry_after_secs } => json!({
                "error": error.to_string(),
                "code": "COOLDOWN",
                "retry_after_secs": retry_after_secs,
            }),
            Error::Carrier(carrier_error) => {
                let mut body = json!({
                    "error": carrier_error.message,
                    "code": carrier_error.kind.as_str(),
                    "retryable": carrier_error.retryable,
                });
                if let Some(retry_after) = carrier_error.retry_after {
                    body["retry_after"] = json!(retry_after.to_rfc3339());
                }
                body
            }
            other => {
                // 5xx details stay in the logs, not the response
                if other.status_code() >= 500 {
                    tracing::error!("request failed: {}", other);
                    json!({
                        "error": "internal server error",
                        "code": other.category().to_uppercase(),
                    })
                } else {
                    json!({
                        "error": other.to_string(),
                        "code": other.category().to_uppercase(),
                    })
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
