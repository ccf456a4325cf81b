//! Conversation Store
//!
//! Single source of truth for conversations and messages. Every mutating
//! operation commits the message write together with the owning
//! conversation's `last_activity_at` update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    Conversation, ConversationStatus, DeliveryStatus, Message, NewInboundMessage, Page,
    StatusUpdate,
};

/// Conversation store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The platform message id is already recorded for this conversation.
    #[error("Message {platform_message_id} already recorded")]
    DuplicateMessage { platform_message_id: String },

    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("Message not found")]
    MessageNotFound,

    /// The requested delivery status change would move backwards or skip a step.
    #[error("Illegal delivery status transition {from:?} -> {to}")]
    InvalidTransition {
        from: Option<DeliveryStatus>,
        to: DeliveryStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the failure is an infrastructure problem worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence port for conversations and messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Return the conversation for a (page, customer) pair, creating it if absent.
    async fn upsert_conversation(
        &self,
        page_id: &str,
        customer_id: &str,
    ) -> StoreResult<Conversation>;

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation>;

    /// Conversations ordered by last activity, most recent first.
    async fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        page: Page,
    ) -> StoreResult<Vec<Conversation>>;

    async fn set_conversation_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> StoreResult<Conversation>;

    /// Append a customer message.
    ///
    /// Fails with [`StoreError::DuplicateMessage`] when the platform message
    /// id is already recorded for the conversation. Reopens a closed
    /// conversation.
    async fn append_inbound_message(
        &self,
        conversation_id: Uuid,
        message: NewInboundMessage,
    ) -> StoreResult<Message>;

    /// Append an agent reply with status `pending`.
    async fn append_outbound_message(
        &self,
        conversation_id: Uuid,
        agent_id: &str,
        text: &str,
        retry_of: Option<Uuid>,
    ) -> StoreResult<Message>;

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message>;

    /// Move an outbound message to `status`, rejecting illegal transitions.
    async fn update_delivery_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
        update: StatusUpdate,
    ) -> StoreResult<Message>;

    /// Promote outbound messages still `sent` whose platform id is listed in
    /// a delivery receipt to `delivered`. Returns the promoted messages.
    async fn confirm_delivered(
        &self,
        conversation_id: Uuid,
        platform_message_ids: &[String],
    ) -> StoreResult<Vec<Message>>;

    /// Messages ordered by business timestamp, oldest first.
    async fn list_messages(&self, conversation_id: Uuid, page: Page) -> StoreResult<Vec<Message>>;

    /// Messages recorded after `since`, in recording order. Used by polling agents.
    async fn messages_recorded_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Message>>;

    /// Outbound messages not yet in a terminal status.
    async fn unfinished_outbound(&self) -> StoreResult<Vec<Message>>;
}
