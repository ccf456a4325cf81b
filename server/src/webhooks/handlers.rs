//! Webhook HTTP Handlers
//!
//! Public endpoints the messaging platform calls. The subscription handshake
//! is a GET; deliveries are POSTs whose raw body is handed to the ingestion
//! pipeline untouched.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::pipeline::{IngestError, IngestReport};
use super::signing::{self, SIGNATURE_HEADER};
use crate::api::AppState;
use crate::auth::ErrorResponse;

/// Subscription handshake parameters.
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE"),
            Self::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD"),
            Self::UnsupportedObject(_) => (StatusCode::NOT_FOUND, "UNSUPPORTED_OBJECT"),
            Self::Infrastructure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let message = match &self {
            Self::Infrastructure(_) => "Temporarily unable to store events".to_string(),
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

/// GET /api/webhook
#[instrument(skip(state, query))]
pub async fn verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    verify_subscription(&state, query)
}

/// GET /api/webhook/{page_id}
#[instrument(skip(state, query))]
pub async fn verify_for_page(
    State(state): State<AppState>,
    Path(page_id): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    verify_subscription(&state, query)
}

fn verify_subscription(state: &AppState, query: VerifyQuery) -> Response {
    let token_matches = query
        .verify_token
        .as_deref()
        .is_some_and(|provided| signing::tokens_match(&state.config.verify_token, provided));

    match (query.mode.as_deref(), token_matches, query.challenge) {
        (Some("subscribe"), true, Some(challenge)) => {
            info!("Webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            warn!("Webhook subscription verification failed");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// POST /api/webhook
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReport>, IngestError> {
    ingest(&state, &headers, &body, None).await
}

/// POST /api/webhook/{page_id}
pub async fn receive_for_page(
    State(state): State<AppState>,
    Path(page_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReport>, IngestError> {
    ingest(&state, &headers, &body, Some(&page_id)).await
}

async fn ingest(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    page_id: Option<&str>,
) -> Result<Json<IngestReport>, IngestError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let report = state.pipeline.ingest(body, signature, page_id).await?;
    Ok(Json(report))
}
