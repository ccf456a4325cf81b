//! Reply Handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::{Action, SessionContext};
use crate::db::Message;

/// Maximum reply length accepted by the messaging API.
pub const MAX_REPLY_CHARS: u64 = 2000;

#[derive(Debug, Deserialize, Validate)]
pub struct ReplyRequest {
    pub conversation_id: Uuid,
    #[validate(length(min = 1, max = 2000, message = "Reply must be 1-2000 characters"))]
    pub body: String,
}

/// Queue an agent reply.
/// POST /api/messages
///
/// Responds as soon as the reply is stored as `pending`; delivery status
/// changes arrive on the notification channel.
#[instrument(skip_all, fields(agent_id = %session.agent_id))]
pub async fn reply(
    State(state): State<AppState>,
    session: SessionContext,
    Json(request): Json<ReplyRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    request.validate()?;
    if request.body.trim().is_empty() {
        return Err(ApiError::Validation("Reply must not be blank".to_string()));
    }
    state
        .gate
        .require(&session, request.conversation_id, Action::Reply)?;

    let message = state
        .relay
        .send(request.conversation_id, &session.agent_id, &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Re-queue a failed reply as a new message.
/// POST /api/messages/{id}/retry
#[instrument(skip_all, fields(agent_id = %session.agent_id, message_id = %id))]
pub async fn retry(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let failed = state.store.get_message(id).await?;
    state
        .gate
        .require(&session, failed.conversation_id, Action::Reply)?;

    let message = state.relay.requeue(id, &session.agent_id).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
