//! Agent API Errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::auth::{AuthError, ErrorResponse};
use crate::db::StoreError;
use crate::relay::RelayError;

/// Errors returned by the agent-facing read and reply endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("Message not found")]
    MessageNotFound,

    #[error("{0}")]
    Validation(String),

    /// Request conflicts with the current state of the resource.
    #[error("{0}")]
    Conflict(String),

    #[error("Internal server error")]
    Internal(#[source] StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConversationNotFound => Self::ConversationNotFound,
            StoreError::MessageNotFound => Self::MessageNotFound,
            StoreError::InvalidTransition { .. } | StoreError::DuplicateMessage { .. } => {
                Self::Conflict(err.to_string())
            }
            StoreError::Database(_) => Self::Internal(err),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Store(e) => e.into(),
            RelayError::NotRetryable { .. } => Self::Conflict(err.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            Self::Auth(inner) => return inner.into_response(),
            Self::ConversationNotFound => (StatusCode::NOT_FOUND, "CONVERSATION_NOT_FOUND"),
            Self::MessageNotFound => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Internal(ref e) => {
                tracing::error!(error = %e, "Store request failed");
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

pub type ApiResult<T> = Result<T, ApiError>;
