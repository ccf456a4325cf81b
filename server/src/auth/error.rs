//! Authentication Error Types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Session and authorization errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No session cookie on the request.
    #[error("Missing session cookie")]
    MissingSession,

    /// Cookie signature did not verify or the session is unknown.
    #[error("Invalid session")]
    InvalidSession,

    /// Session exists but has expired.
    #[error("Session expired")]
    SessionExpired,

    /// Session is valid but may not perform the action.
    #[error("Access denied")]
    Forbidden,

    /// Session store error.
    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

/// Error response body for JSON responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::MissingSession => (StatusCode::UNAUTHORIZED, "MISSING_SESSION"),
            Self::InvalidSession => (StatusCode::UNAUTHORIZED, "INVALID_SESSION"),
            Self::SessionExpired => (StatusCode::UNAUTHORIZED, "SESSION_EXPIRED"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::Database(e) => {
                tracing::error!(error = %e, "Session lookup failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = Json(ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;
