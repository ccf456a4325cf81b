//! API Router and Application State
//!
//! Central routing configuration and shared state.

mod error;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, Method, Request},
    middleware::from_fn_with_state,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    auth::{self, SessionGate, SessionResolver},
    chat,
    config::Config,
    db::ConversationStore,
    notify::{self, NotificationHub},
    relay::{self, Messenger, RelayHandle, RetryPolicy},
    webhooks::{self, EventDeduplicator, IngestionPipeline},
};

pub use error::{ApiError, ApiResult};

/// Storage and transport backends the application is assembled from.
pub struct Backends {
    pub store: Arc<dyn ConversationStore>,
    pub dedup: Arc<dyn EventDeduplicator>,
    pub sessions: Arc<dyn SessionResolver>,
    pub messenger: Arc<dyn Messenger>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Conversation store
    pub store: Arc<dyn ConversationStore>,
    /// Inbound webhook pipeline
    pub pipeline: IngestionPipeline,
    /// Outbound reply relay
    pub relay: RelayHandle,
    /// Agent notification hub
    pub notifications: NotificationHub,
    /// Agent session lookup
    pub sessions: Arc<dyn SessionResolver>,
    /// Per-conversation authorization
    pub gate: SessionGate,
    /// Server configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the components together and start the relay worker.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(config: Config, backends: Backends) -> Self {
        let notifications = NotificationHub::new();
        let pipeline = IngestionPipeline::new(
            backends.store.clone(),
            backends.dedup,
            notifications.clone(),
            config.app_secret.clone(),
            config.dedup_timeout,
        );
        let relay = relay::spawn_delivery_worker(
            backends.store.clone(),
            backends.messenger,
            notifications.clone(),
            RetryPolicy::from_config(&config),
        );

        Self {
            store: backends.store,
            pipeline,
            relay,
            notifications,
            sessions: backends.sessions,
            gate: SessionGate::default(),
            config: Arc::new(config),
        }
    }

    /// Replace the authorization policy.
    #[must_use]
    pub fn with_gate(mut self, gate: SessionGate) -> Self {
        self.gate = gate;
        self
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let max_webhook_body = state.config.max_webhook_body;

    // Routes that require an agent session
    let protected_routes = Router::new()
        .route("/api/me", get(chat::me))
        .nest("/api/conversations", chat::conversations_router())
        .nest("/api/messages", chat::messages_router())
        .route("/api/notifications", get(notify::handlers::poll))
        .route("/api/notifications/ws", get(notify::handlers::subscribe))
        .layer(from_fn_with_state(state.clone(), auth::require_session));

    Router::new()
        // Health checks
        .route("/", get(greeting))
        .route("/health", get(health_check))
        // Platform webhooks (signature-verified, no session)
        .nest("/api/webhook", webhooks::router())
        .merge(protected_routes)
        // Middleware
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
                agent_id = tracing::field::Empty,
            )
        }))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_webhook_body))
        .with_state(state)
}

async fn greeting() -> &'static str {
    "Hello from Helpdesk backend!"
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Connected notification subscribers
    notification_subscribers: usize,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        notification_subscribers: state.notifications.subscriber_count(),
    })
}
