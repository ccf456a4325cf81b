//! In-memory Conversation Store
//!
//! Backs tests and local runs without `PostgreSQL`. Each conversation lives in
//! its own map entry, so appends to different conversations do not contend.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::models::{
    conversation_id_for, Conversation, ConversationStatus, DeliveryStatus, Direction, Message,
    NewInboundMessage, Page, StatusUpdate,
};
use super::store::{ConversationStore, StoreError, StoreResult};

#[derive(Debug)]
struct ConversationLog {
    conversation: Conversation,
    /// Sorted by `(created_at, id)`.
    messages: Vec<Message>,
    platform_ids: HashSet<String>,
}

impl ConversationLog {
    fn insert_sorted(&mut self, message: Message) {
        let key = (message.created_at, message.id);
        let idx = self
            .messages
            .partition_point(|m| (m.created_at, m.id) <= key);
        self.messages.insert(idx, message);
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.conversation.last_activity_at {
            self.conversation.last_activity_at = at;
        }
    }
}

/// Conversation store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: DashMap<Uuid, ConversationLog>,
    /// message id -> conversation id
    message_index: DashMap<Uuid, Uuid>,
}

impl MemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn conversation_of(&self, message_id: Uuid) -> StoreResult<Uuid> {
        self.message_index
            .get(&message_id)
            .map(|entry| *entry.value())
            .ok_or(StoreError::MessageNotFound)
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn upsert_conversation(
        &self,
        page_id: &str,
        customer_id: &str,
    ) -> StoreResult<Conversation> {
        let id = conversation_id_for(page_id, customer_id);
        let log = self.conversations.entry(id).or_insert_with(|| ConversationLog {
            conversation: Conversation {
                id,
                page_id: page_id.to_string(),
                customer_id: customer_id.to_string(),
                customer_display: customer_id.to_string(),
                status: ConversationStatus::Open,
                last_activity_at: DateTime::<Utc>::UNIX_EPOCH,
                created_at: Utc::now(),
            },
            messages: Vec::new(),
            platform_ids: HashSet::new(),
        });
        Ok(log.conversation.clone())
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation> {
        self.conversations
            .get(&conversation_id)
            .map(|log| log.conversation.clone())
            .ok_or(StoreError::ConversationNotFound)
    }

    async fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        page: Page,
    ) -> StoreResult<Vec<Conversation>> {
        let mut all: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|log| log.conversation.clone())
            .filter(|c| status.is_none_or(|s| c.status == s))
            .collect();
        all.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(all
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn set_conversation_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> StoreResult<Conversation> {
        let mut log = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;
        log.conversation.status = status;
        Ok(log.conversation.clone())
    }

    async fn append_inbound_message(
        &self,
        conversation_id: Uuid,
        message: NewInboundMessage,
    ) -> StoreResult<Message> {
        let mut log = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;

        if !log.platform_ids.insert(message.platform_message_id.clone()) {
            return Err(StoreError::DuplicateMessage {
                platform_message_id: message.platform_message_id,
            });
        }

        let stored = Message {
            id: Uuid::now_v7(),
            conversation_id,
            platform_message_id: Some(message.platform_message_id),
            direction: Direction::Inbound,
            author_id: message.customer_id,
            text: message.text,
            payload: message.payload,
            created_at: message.timestamp,
            recorded_at: Utc::now(),
            delivery_status: None,
            failure_reason: None,
            attempts: 0,
            retry_of: None,
        };

        log.touch(stored.created_at);
        log.conversation.status = ConversationStatus::Open;
        log.insert_sorted(stored.clone());
        self.message_index.insert(stored.id, conversation_id);

        Ok(stored)
    }

    async fn append_outbound_message(
        &self,
        conversation_id: Uuid,
        agent_id: &str,
        text: &str,
        retry_of: Option<Uuid>,
    ) -> StoreResult<Message> {
        let mut log = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;

        let now = Utc::now();
        let stored = Message {
            id: Uuid::now_v7(),
            conversation_id,
            platform_message_id: None,
            direction: Direction::Outbound,
            author_id: agent_id.to_string(),
            text: Some(text.to_string()),
            payload: None,
            created_at: now,
            recorded_at: now,
            delivery_status: Some(DeliveryStatus::Pending),
            failure_reason: None,
            attempts: 0,
            retry_of,
        };

        log.touch(now);
        log.insert_sorted(stored.clone());
        self.message_index.insert(stored.id, conversation_id);

        Ok(stored)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let conversation_id = self.conversation_of(message_id)?;
        let log = self
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;
        log.messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or(StoreError::MessageNotFound)
    }

    async fn update_delivery_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
        update: StatusUpdate,
    ) -> StoreResult<Message> {
        let conversation_id = self.conversation_of(message_id)?;
        let mut log = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;

        let message = log
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(StoreError::MessageNotFound)?;

        let legal = message.direction == Direction::Outbound
            && message
                .delivery_status
                .is_some_and(|current| current.can_transition_to(status));
        if !legal {
            return Err(StoreError::InvalidTransition {
                from: message.delivery_status,
                to: status,
            });
        }

        message.delivery_status = Some(status);
        if let Some(mid) = update.platform_message_id {
            message.platform_message_id = Some(mid);
        }
        if let Some(reason) = update.failure_reason {
            message.failure_reason = Some(reason);
        }
        if let Some(attempts) = update.attempts {
            message.attempts = attempts;
        }
        Ok(message.clone())
    }

    async fn confirm_delivered(
        &self,
        conversation_id: Uuid,
        platform_message_ids: &[String],
    ) -> StoreResult<Vec<Message>> {
        let mut log = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;

        let promoted = log
            .messages
            .iter_mut()
            .filter(|m| {
                m.delivery_status == Some(DeliveryStatus::Sent)
                    && m
                        .platform_message_id
                        .as_ref()
                        .is_some_and(|mid| platform_message_ids.contains(mid))
            })
            .map(|m| {
                m.delivery_status = Some(DeliveryStatus::Delivered);
                m.clone()
            })
            .collect();
        Ok(promoted)
    }

    async fn list_messages(&self, conversation_id: Uuid, page: Page) -> StoreResult<Vec<Message>> {
        let log = self
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::ConversationNotFound)?;
        Ok(log
            .messages
            .iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn messages_recorded_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let mut recent: Vec<Message> = self
            .conversations
            .iter()
            .flat_map(|log| {
                log.messages
                    .iter()
                    .filter(|m| m.recorded_at > since)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        recent.sort_by(|a, b| (a.recorded_at, a.id).cmp(&(b.recorded_at, b.id)));
        recent.truncate(limit.max(0) as usize);
        Ok(recent)
    }

    async fn unfinished_outbound(&self) -> StoreResult<Vec<Message>> {
        let mut unfinished: Vec<Message> = self
            .conversations
            .iter()
            .flat_map(|log| {
                log.messages
                    .iter()
                    .filter(|m| m.delivery_status.is_some_and(|s| !s.is_terminal()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        unfinished.sort_by_key(|m| m.created_at);
        Ok(unfinished)
    }
}
