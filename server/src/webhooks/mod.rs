//! Inbound Webhooks
//!
//! Receives signed deliveries from the messaging platform, drops
//! redeliveries, and records customer messages in the conversation store.

pub mod dedup;
pub mod events;
pub mod handlers;
pub mod pipeline;
pub mod signing;

use axum::{routing::get, Router};

use crate::api::AppState;

pub use dedup::{
    spawn_retention_task, EventDeduplicator, MemoryEventDeduplicator, PgEventDeduplicator,
    RedisEventDeduplicator,
};
pub use pipeline::{IngestError, IngestReport, IngestionPipeline};

/// Create the public webhook router.
///
/// - GET/POST / - handshake and deliveries for any page
/// - GET/POST /{page_id} - same, restricted to one page
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::verify).post(handlers::receive))
        .route(
            "/{page_id}",
            get(handlers::verify_for_page).post(handlers::receive_for_page),
        )
}
