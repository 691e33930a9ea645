use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use quill_core::error::SessionError;
use quill_store::StoreError;

/// HTTP projection of the canonical error taxonomy. Bodies are
/// `{type, error: {type, message}}` with the taxonomy name in both places.
#[derive(Debug)]
pub struct ApiError(pub SessionError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
            SessionError::Busy { .. } => StatusCode::CONFLICT,
            SessionError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            SessionError::AuthError { .. } => StatusCode::UNAUTHORIZED,
            SessionError::OverflowError { .. }
            | SessionError::OutputLengthError
            | SessionError::ToolBlocked { .. }
            | SessionError::Aborted => StatusCode::BAD_REQUEST,
            SessionError::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = json!({
            "type": kind,
            "error": { "type": kind, "message": self.0.to_string() },
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err.into())
    }
}
