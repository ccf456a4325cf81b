//! Notification Endpoints
//!
//! `GET /api/notifications/ws` pushes events over a WebSocket.
//! `GET /api/notifications` lets a dashboard poll (or catch up after a
//! reconnect) from the conversation store.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ApiResult, AppState};
use crate::auth::{Action, SessionContext};
use crate::db::{Message, Page};

/// Writes slower than this may commit behind a later `recorded_at`.
/// The cursor never passes `now - SETTLE_LAG_SECS`, so such rows are still
/// returned on the next poll. Clients dedupe by message id.
const SETTLE_LAG_SECS: i64 = 5;

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Return messages recorded strictly after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub messages: Vec<Message>,
    /// Value to pass as `since` on the next poll. Recent messages may be
    /// returned again.
    pub cursor: DateTime<Utc>,
}

/// Poll for messages recorded since a cursor.
#[tracing::instrument(skip(state, session), fields(agent_id = %session.agent_id))]
pub async fn poll(
    State(state): State<AppState>,
    session: SessionContext,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<PollResponse>> {
    let since = query.since.unwrap_or(DateTime::UNIX_EPOCH);
    let limit = Page::new(query.limit, None).limit;

    let recorded = state.store.messages_recorded_since(since, limit).await?;
    let cursor = next_cursor(since, recorded.last().map(|m| m.recorded_at), Utc::now());
    let messages = recorded
        .into_iter()
        .filter(|m| {
            state
                .gate
                .authorize(&session, m.conversation_id, Action::Read)
                .is_allowed()
        })
        .collect();

    Ok(Json(PollResponse { messages, cursor }))
}

/// Advance to the newest returned row, held back by the settle lag.
fn next_cursor(
    since: DateTime<Utc>,
    newest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let settled = now - chrono::Duration::seconds(SETTLE_LAG_SECS);
    newest.map_or(since, |newest| newest.min(settled)).max(since)
}

/// Upgrade to a WebSocket carrying this session's notifications.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    session: SessionContext,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session))
}

async fn handle_socket(socket: WebSocket, state: AppState, session: SessionContext) {
    let agent_id = session.agent_id.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut notifications = Box::pin(
        state
            .notifications
            .subscribe(session, state.gate.clone()),
    );

    info!(agent_id = %agent_id, "Notification socket connected");

    loop {
        tokio::select! {
            notification = notifications.next() => {
                let Some(notification) = notification else {
                    debug!(agent_id = %agent_id, "Notification stream ended");
                    break;
                };
                let json = match serde_json::to_string(&notification) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize notification");
                        continue;
                    }
                };
                if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                    // Clients only listen; anything they send is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_sender.send(WsMessage::Close(None)).await;
    info!(agent_id = %agent_id, "Notification socket closed");
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn cursor_follows_settled_rows() {
        assert_eq!(next_cursor(at(0), Some(at(10)), at(60)), at(10));
        assert_eq!(next_cursor(at(0), None, at(60)), at(0));
    }

    #[test]
    fn cursor_holds_back_for_late_commits() {
        // Row B (recorded at 30) is visible; row A (recorded at 29) commits later.
        let cursor = next_cursor(at(0), Some(at(30)), at(31));
        assert_eq!(cursor, at(31 - SETTLE_LAG_SECS));
        assert!(at(29) > cursor, "a late commit must stay after the cursor");
    }

    #[test]
    fn cursor_never_moves_backwards() {
        assert_eq!(next_cursor(at(40), Some(at(41)), at(42)), at(40));
    }
}
