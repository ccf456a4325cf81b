//! Agent Inbox API
//!
//! Read conversations and messages, and queue replies. All routes require an
//! agent session.

mod conversations;
mod messages;

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::AppState;

pub use conversations::me;
pub use messages::MAX_REPLY_CHARS;

/// Create the conversations router.
pub fn conversations_router() -> Router<AppState> {
    Router::new()
        .route("/", get(conversations::list))
        .route("/{id}", get(conversations::get))
        .route("/{id}/close", post(conversations::close))
        .route("/{id}/reopen", post(conversations::reopen))
        .route("/{id}/messages", get(conversations::list_messages))
}

/// Create the messages router.
pub fn messages_router() -> Router<AppState> {
    Router::new()
        .route("/", post(messages::reply))
        .route("/{id}/retry", post(messages::retry))
}
