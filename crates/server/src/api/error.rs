//! The HTTP-facing error adapter: maps [`gridserve_core::CoreError`] to a
//! status code and a JSON body, the same "domain error enum + thin HTTP
//! adapter" split the teacher draws between its internal errors and
//! `agent::api::error::ApiError`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use gridserve_core::CoreError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        ApiError { status, error: error.into() }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        use CoreError::*;

        let status = match &error {
            NotFound { .. } => StatusCode::NOT_FOUND,
            AlreadyExists { .. } => StatusCode::CONFLICT,
            InvalidTransition { .. } => StatusCode::CONFLICT,
            LimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden { .. } => StatusCode::FORBIDDEN,
            // A computation that failed is still a successful protocol
            // exchange about a record's outcome, not a request failure.
            ComputationFailed { .. } => StatusCode::OK,
            DeveloperError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Database(inner) => {
                tracing::error!(error = ?inner, "API responding with database error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            ApiError::new(status, "internal error, please retry the request")
        } else {
            ApiError::new(status, error.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}
