//! Conversation Handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiResult, AppState};
use crate::auth::{Action, SessionContext};
use crate::db::{Conversation, ConversationStatus, Message, Page};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<ConversationStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Identity bound to the current session.
#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub session_expires_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/me
pub async fn me(session: SessionContext) -> Json<AgentResponse> {
    Json(AgentResponse {
        agent_id: session.agent_id,
        agent_name: session.agent_name,
        session_expires_at: session.expires_at,
    })
}

/// List conversations, most recently active first.
/// GET /api/conversations
pub async fn list(
    State(state): State<AppState>,
    session: SessionContext,
    Query(query): Query<ListConversationsQuery>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let page = Page::new(query.limit, query.offset);
    let conversations = state.store.list_conversations(query.status, page).await?;

    let visible = conversations
        .into_iter()
        .filter(|c| {
            state
                .gate
                .authorize(&session, c.id, Action::Read)
                .is_allowed()
        })
        .collect();
    Ok(Json(visible))
}

/// GET /api/conversations/{id}
pub async fn get(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    state.gate.require(&session, id, Action::Read)?;
    Ok(Json(state.store.get_conversation(id).await?))
}

/// Archive a conversation.
/// POST /api/conversations/{id}/close
pub async fn close(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    set_status(&state, &session, id, ConversationStatus::Closed).await
}

/// POST /api/conversations/{id}/reopen
pub async fn reopen(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    set_status(&state, &session, id, ConversationStatus::Open).await
}

async fn set_status(
    state: &AppState,
    session: &SessionContext,
    id: Uuid,
    status: ConversationStatus,
) -> ApiResult<Json<Conversation>> {
    state.gate.require(session, id, Action::Reply)?;
    let conversation = state.store.set_conversation_status(id, status).await?;
    tracing::info!(
        conversation_id = %id,
        agent_id = %session.agent_id,
        status = ?status,
        "Conversation status changed"
    );
    Ok(Json(conversation))
}

/// List a conversation's messages, oldest first.
/// GET /api/conversations/{id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    state.gate.require(&session, id, Action::Read)?;
    let page = Page::new(query.limit, query.offset);
    Ok(Json(state.store.list_messages(id, page).await?))
}
