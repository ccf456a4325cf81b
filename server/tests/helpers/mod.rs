//! Reusable test helpers for HTTP integration tests.
//!
//! Provides `TestApp` for sending requests through the full axum router over
//! in-memory backends, a scripted messenger standing in for the Send API,
//! and utilities for signed webhook bodies and agent session cookies.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{self, Method, Request, Response};
use axum::Router;
use chrono::Utc;
use helpdesk_server::api::{create_router, AppState, Backends};
use helpdesk_server::auth::{sign_session_id, MemorySessionResolver, SessionContext};
use helpdesk_server::config::Config;
use helpdesk_server::db::{ConversationStore, DeliveryStatus, MemoryConversationStore, Message};
use helpdesk_server::relay::{Messenger, SendError, SendReceipt};
use helpdesk_server::webhooks::signing::{sign_payload, SIGNATURE_HEADER};
use helpdesk_server::webhooks::MemoryEventDeduplicator;
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

// ============================================================================
// Scripted Messenger
// ============================================================================

/// Messenger that replays scripted results, then succeeds.
#[derive(Default)]
pub struct ScriptedMessenger {
    script: Mutex<VecDeque<Result<SendReceipt, SendError>>>,
    calls: AtomicU32,
}

impl ScriptedMessenger {
    /// Queue results for the next calls, in order.
    pub fn push(&self, results: impl IntoIterator<Item = Result<SendReceipt, SendError>>) {
        self.script.lock().unwrap().extend(results);
    }

    /// Number of Send API calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Messenger for ScriptedMessenger {
    async fn send_text(&self, _recipient_id: &str, _text: &str) -> Result<SendReceipt, SendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(SendReceipt {
                message_id: Some(format!("m_out_{n}")),
            })
        })
    }
}

// ============================================================================
// Test App
// ============================================================================

/// A test application wrapping the full axum router.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryConversationStore>,
    pub sessions: Arc<MemorySessionResolver>,
    pub messenger: Arc<ScriptedMessenger>,
    pub config: Arc<Config>,
}

impl TestApp {
    /// Create a new test app over fresh in-memory backends.
    pub fn new() -> Self {
        Self::with_config(Config::default_for_test())
    }

    /// Create a test app with a custom config.
    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryConversationStore::new());
        let sessions = Arc::new(MemorySessionResolver::new());
        let messenger = Arc::new(ScriptedMessenger::default());

        let state = AppState::new(
            config.clone(),
            Backends {
                store: store.clone(),
                dedup: Arc::new(MemoryEventDeduplicator::new()),
                sessions: sessions.clone(),
                messenger: messenger.clone(),
            },
        );
        let router = create_router(state.clone());

        Self {
            router,
            state,
            store,
            sessions,
            messenger,
            config: Arc::new(config),
        }
    }

    /// Build an HTTP request with the given method and URI.
    pub fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    /// Send a request through the router via `tower::ServiceExt::oneshot`.
    pub async fn oneshot(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("oneshot request failed")
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Register a live agent session and return its `Cookie` header value.
    pub fn login(&self, agent_id: &str) -> String {
        self.session_cookie(agent_id, chrono::Duration::hours(24))
    }

    /// Register a session expiring after `ttl` (negative for already expired).
    pub fn session_cookie(&self, agent_id: &str, ttl: chrono::Duration) -> String {
        self.new_session(agent_id, ttl).1
    }

    /// Register a session and return it alongside its `Cookie` header value.
    pub fn new_session(&self, agent_id: &str, ttl: chrono::Duration) -> (SessionContext, String) {
        let session = SessionContext {
            session_id: Uuid::new_v4().simple().to_string(),
            agent_id: agent_id.to_string(),
            agent_name: format!("Agent {agent_id}"),
            expires_at: Utc::now() + ttl,
        };
        self.sessions.insert(session.clone());

        let signed = sign_session_id(&session.session_id, &self.config.session_secret);
        // Browsers send the value percent-encoded, as issued.
        let cookie = format!(
            "{}={}",
            self.config.session_cookie_name,
            urlencoding::encode(&signed)
        );
        (session, cookie)
    }

    /// GET `uri` as the agent owning `cookie`.
    pub async fn get(&self, uri: &str, cookie: &str) -> Response<Body> {
        let req = Self::request(Method::GET, uri)
            .header("Cookie", cookie)
            .body(Body::empty())
            .unwrap();
        self.oneshot(req).await
    }

    /// POST a JSON body to `uri` as the agent owning `cookie`.
    pub async fn post_json(
        &self,
        uri: &str,
        cookie: &str,
        body: &serde_json::Value,
    ) -> Response<Body> {
        let req = Self::request(Method::POST, uri)
            .header("Cookie", cookie)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.oneshot(req).await
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// POST a raw webhook body signed with the app secret.
    pub async fn deliver(&self, raw_body: &[u8]) -> Response<Body> {
        let signature = sign_payload(&self.config.app_secret, raw_body);
        self.deliver_with_signature(raw_body, Some(&signature)).await
    }

    /// POST a raw webhook body with an arbitrary signature header.
    pub async fn deliver_with_signature(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Response<Body> {
        let mut req = Self::request(Method::POST, "/api/webhook")
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            req = req.header(SIGNATURE_HEADER, signature);
        }
        self.oneshot(req.body(Body::from(raw_body.to_vec())).unwrap())
            .await
    }

    // ------------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------------

    /// Poll the store until the message reaches a terminal delivery status.
    pub async fn wait_for_settled(&self, message_id: Uuid) -> Message {
        for _ in 0..500 {
            let message = self.store.get_message(message_id).await.unwrap();
            if message
                .delivery_status
                .is_some_and(DeliveryStatus::is_terminal)
            {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("message {message_id} never settled");
    }
}

// ============================================================================
// Payload builders
// ============================================================================

/// A customer text message event.
pub fn text_event(customer: &str, mid: &str, text: &str, timestamp_ms: i64) -> serde_json::Value {
    serde_json::json!({
        "sender": { "id": customer },
        "recipient": { "id": "PAGE" },
        "timestamp": timestamp_ms,
        "message": { "mid": mid, "text": text }
    })
}

/// A webhook delivery body for one page.
pub fn page_delivery(page_id: &str, events: Vec<serde_json::Value>) -> Vec<u8> {
    serde_json::json!({
        "object": "page",
        "entry": [{
            "id": page_id,
            "time": 1_700_000_000_000_i64,
            "messaging": events
        }]
    })
    .to_string()
    .into_bytes()
}

/// Convert a response body to JSON.
pub async fn body_to_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

/// Convert a response body to a string.
pub async fn body_to_string(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("body is not UTF-8")
}
