//! Database Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Namespace for deriving conversation ids from (page, customer) pairs.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6d1c_22a4_8f0e_4b7a_9c3e_5b2f_1a47_d8e3);

/// Conversation identifier derived from the platform's page and customer ids.
///
/// The same pair always maps to the same id, regardless of which backend
/// created the row.
#[must_use]
pub fn conversation_id_for(page_id: &str, customer_id: &str) -> Uuid {
    Uuid::new_v5(
        &CONVERSATION_NAMESPACE,
        format!("{page_id}:{customer_id}").as_bytes(),
    )
}

/// Conversation model.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub page_id: String,
    pub customer_id: String,
    /// Display reference shown in the inbox (defaults to the customer id).
    pub customer_display: String,
    pub status: ConversationStatus,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Conversation lifecycle status. Conversations are archived, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conversation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Closed,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Customer to page.
    Inbound,
    /// Agent reply relayed to the customer.
    Outbound,
}

/// Outbound delivery status.
///
/// Legal transitions: `pending -> sent -> delivered`, `pending -> failed`,
/// `sent -> failed`. `delivered` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Delivered,
}

impl DeliveryStatus {
    /// Statuses a message may hold immediately before moving to `self`.
    #[must_use]
    pub const fn predecessors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[],
            Self::Sent => &[Self::Pending],
            Self::Failed => &[Self::Pending, Self::Sent],
            Self::Delivered => &[Self::Sent],
        }
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next.predecessors().contains(&self)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Delivered)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Delivered => "delivered",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Platform-assigned id. Always set for inbound; set for outbound once delivered.
    pub platform_message_id: Option<String>,
    pub direction: Direction,
    /// Customer id for inbound, agent id for outbound.
    pub author_id: String,
    pub text: Option<String>,
    /// Generic payload envelope (postback data, attachments).
    pub payload: Option<serde_json::Value>,
    /// Business timestamp: the platform's event time for inbound, creation time for outbound.
    pub created_at: DateTime<Utc>,
    /// When this service stored the message.
    pub recorded_at: DateTime<Utc>,
    pub delivery_status: Option<DeliveryStatus>,
    pub failure_reason: Option<String>,
    pub attempts: i32,
    /// For re-queued replies, the failed message this one replaces.
    pub retry_of: Option<Uuid>,
}

/// New inbound message as parsed from a webhook event.
#[derive(Debug, Clone)]
pub struct NewInboundMessage {
    pub platform_message_id: String,
    pub customer_id: String,
    pub text: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Status change applied by the outbound relay.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub platform_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub attempts: Option<i32>,
}

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    /// Build a page, clamping the limit to `1..=MAX_LIMIT` and the offset to `>= 0`.
    #[must_use]
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}
