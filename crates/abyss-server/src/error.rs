use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use abyss_shared::error::AbyssError;
use abyss_store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotAuthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
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

impl From<AbyssError> for ApiError {
    fn from(e: AbyssError) -> Self {
        match e {
            AbyssError::TokenMissing | AbyssError::IpMismatch => ApiError::NotAuthenticated,
            AbyssError::PermissionDenied => ApiError::Forbidden("permission denied".into()),
            AbyssError::SignatureInvalid
            | AbyssError::ChallengeMissing
            | AbyssError::UserNotFound
            | AbyssError::PrivilegeExceeded => ApiError::Forbidden(e.to_string()),
            AbyssError::DuplicateUser | AbyssError::Conflict(_) => {
                ApiError::Forbidden(e.to_string())
            }
            AbyssError::Malformed(_) | AbyssError::UsernameInvalid => {
                ApiError::BadRequest(e.to_string())
            }
            AbyssError::NotFound => ApiError::NotFound("no such resource".into()),
            AbyssError::AuthFailure
            | AbyssError::CryptoFailure
            | AbyssError::CounterExhausted
            | AbyssError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("no such record".into()),
            StoreError::DuplicateUser | StoreError::DuplicateAttribute => {
                ApiError::Forbidden(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
