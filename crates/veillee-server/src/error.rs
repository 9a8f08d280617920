use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use veillee_shared::RoomIdError;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    AuthRequired,

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("invalid room id: {0}")]
    InvalidRoomId(#[from] RoomIdError),

    #[error("internal error: {0}")]
    #[allow(dead_code)]
    Internal(String),
}

impl From<AuthError> for ApiError {
    // Control-plane callers get one opaque auth failure, whatever the cause.
    fn from(_: AuthError) -> Self {
        ApiError::AuthRequired
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::AuthRequired => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::RoomNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::InvalidRoomId(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
