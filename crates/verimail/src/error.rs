//! Error handling for the verification service.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Verification service error types
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Invalid email address: {0}")]
    ValidationFailed(String),

    #[error("Failed to send verification email: {0}")]
    DispatchFailed(String),

    #[error("Invalid or expired verification link")]
    TokenNotFound,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl VerifyError {
    /// Wrap any storage-layer fault
    pub fn storage(err: impl std::fmt::Display) -> Self {
        VerifyError::StorageUnavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for VerifyError {
    fn from(err: rusqlite::Error) -> Self {
        VerifyError::storage(err)
    }
}

impl IntoResponse for VerifyError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_message) = match &self {
            VerifyError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            VerifyError::DispatchFailed(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            VerifyError::TokenNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            VerifyError::StorageUnavailable(_) | VerifyError::Internal(_) => {
                error!("Request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            VerifyError::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias for verification operations
pub type VerifyResult<T> = Result<T, VerifyError>;
