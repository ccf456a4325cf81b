//! Session Gate
//!
//! Decides whether an authenticated agent may act on a conversation. The
//! decision is delegated to an [`AccessPolicy`]; the default policy treats
//! every agent as a member of one shared inbox.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::error::AuthError;
use super::session::SessionContext;

/// What the agent wants to do with a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// View the conversation, its messages or its notifications.
    Read,
    /// Send a reply, retry a reply or change the conversation status.
    Reply,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Per-conversation access rule.
pub trait AccessPolicy: Send + Sync {
    fn decide(&self, session: &SessionContext, conversation_id: Uuid, action: Action) -> Decision;
}

/// Every agent may read and reply to every conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedInbox;

impl AccessPolicy for SharedInbox {
    fn decide(&self, _session: &SessionContext, _conversation_id: Uuid, _action: Action) -> Decision {
        Decision::Allowed
    }
}

/// Authorization entry point shared by HTTP handlers and the notification
/// stream.
#[derive(Clone)]
pub struct SessionGate {
    policy: Arc<dyn AccessPolicy>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new(Arc::new(SharedInbox))
    }
}

impl SessionGate {
    #[must_use]
    pub fn new(policy: Arc<dyn AccessPolicy>) -> Self {
        Self { policy }
    }

    /// Expired sessions are always denied, whatever the policy says.
    #[must_use]
    pub fn authorize(
        &self,
        session: &SessionContext,
        conversation_id: Uuid,
        action: Action,
    ) -> Decision {
        if session.is_expired_at(Utc::now()) {
            return Decision::Denied;
        }
        self.policy.decide(session, conversation_id, action)
    }

    /// Like [`authorize`](Self::authorize) but as a `Result` for handlers.
    pub fn require(
        &self,
        session: &SessionContext,
        conversation_id: Uuid,
        action: Action,
    ) -> Result<(), AuthError> {
        if session.is_expired_at(Utc::now()) {
            return Err(AuthError::SessionExpired);
        }
        match self.policy.decide(session, conversation_id, action) {
            Decision::Allowed => Ok(()),
            Decision::Denied => Err(AuthError::Forbidden),
        }
    }
}
