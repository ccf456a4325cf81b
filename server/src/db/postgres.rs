//! `PostgreSQL` Conversation Store
//!
//! Uses runtime queries (`sqlx::query` / `sqlx::query_as`) to avoid
//! requiring a live database at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::models::{
    conversation_id_for, Conversation, ConversationStatus, DeliveryStatus, Direction, Message,
    NewInboundMessage, Page, StatusUpdate,
};
use super::store::{ConversationStore, StoreError, StoreResult};

/// Postgres error code for foreign key violations.
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Conversation store backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a foreign key violation on `conversation_id` to `ConversationNotFound`.
fn map_conversation_fk(err: sqlx::Error) -> StoreError {
    let is_fk = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == FOREIGN_KEY_VIOLATION);
    if is_fk {
        StoreError::ConversationNotFound
    } else {
        StoreError::Database(err)
    }
}

/// Advance `last_activity_at` inside an open transaction. Never moves it backwards.
async fn touch_conversation(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    conversation_id: Uuid,
    at: DateTime<Utc>,
    reopen: bool,
) -> StoreResult<()> {
    let result = sqlx::query(
        r"
        UPDATE conversations
        SET last_activity_at = GREATEST(last_activity_at, $2),
            status = CASE WHEN $3 THEN 'open'::conversation_status ELSE status END
        WHERE id = $1
        ",
    )
    .bind(conversation_id)
    .bind(at)
    .bind(reopen)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::ConversationNotFound);
    }
    Ok(())
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn upsert_conversation(
        &self,
        page_id: &str,
        customer_id: &str,
    ) -> StoreResult<Conversation> {
        // The no-op DO UPDATE makes RETURNING yield the existing row on conflict.
        let conversation = sqlx::query_as::<_, Conversation>(
            r"
            INSERT INTO conversations (id, page_id, customer_id, customer_display, last_activity_at)
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (page_id, customer_id) DO UPDATE SET page_id = EXCLUDED.page_id
            RETURNING *
            ",
        )
        .bind(conversation_id_for(page_id, customer_id))
        .bind(page_id)
        .bind(customer_id)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .fetch_one(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ConversationNotFound)
    }

    async fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        page: Page,
    ) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, Conversation>(
            r"
            SELECT * FROM conversations
            WHERE ($1::conversation_status IS NULL OR status = $1)
            ORDER BY last_activity_at DESC, id
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(status)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn set_conversation_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> StoreResult<Conversation> {
        sqlx::query_as::<_, Conversation>(
            "UPDATE conversations SET status = $2 WHERE id = $1 RETURNING *",
        )
        .bind(conversation_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ConversationNotFound)
    }

    async fn append_inbound_message(
        &self,
        conversation_id: Uuid,
        message: NewInboundMessage,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, Message>(
            r"
            INSERT INTO messages
                (id, conversation_id, platform_message_id, direction, author_id, text, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (conversation_id, platform_message_id) DO NOTHING
            RETURNING *
            ",
        )
        .bind(Uuid::now_v7())
        .bind(conversation_id)
        .bind(&message.platform_message_id)
        .bind(Direction::Inbound)
        .bind(&message.customer_id)
        .bind(&message.text)
        .bind(&message.payload)
        .bind(message.timestamp)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_conversation_fk)?;

        let Some(stored) = inserted else {
            debug!(
                conversation_id = %conversation_id,
                platform_message_id = %message.platform_message_id,
                "Inbound message already stored"
            );
            return Err(StoreError::DuplicateMessage {
                platform_message_id: message.platform_message_id,
            });
        };

        touch_conversation(&mut tx, conversation_id, stored.created_at, true).await?;
        tx.commit().await?;

        Ok(stored)
    }

    async fn append_outbound_message(
        &self,
        conversation_id: Uuid,
        agent_id: &str,
        text: &str,
        retry_of: Option<Uuid>,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, Message>(
            r"
            INSERT INTO messages
                (id, conversation_id, direction, author_id, text, created_at, delivery_status, retry_of)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            ",
        )
        .bind(Uuid::now_v7())
        .bind(conversation_id)
        .bind(Direction::Outbound)
        .bind(agent_id)
        .bind(text)
        .bind(Utc::now())
        .bind(DeliveryStatus::Pending)
        .bind(retry_of)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_conversation_fk)?;

        touch_conversation(&mut tx, conversation_id, stored.created_at, false).await?;
        tx.commit().await?;

        Ok(stored)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::MessageNotFound)
    }

    async fn update_delivery_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
        update: StatusUpdate,
    ) -> StoreResult<Message> {
        let allowed_from: Vec<&str> = status.predecessors().iter().map(|s| s.as_str()).collect();

        // The predecessor filter makes the transition check and the write one statement.
        let updated = sqlx::query_as::<_, Message>(
            r"
            UPDATE messages
            SET delivery_status = $2,
                platform_message_id = COALESCE($3, platform_message_id),
                failure_reason = COALESCE($4, failure_reason),
                attempts = COALESCE($5, attempts)
            WHERE id = $1
              AND direction = 'outbound'
              AND delivery_status::text = ANY($6)
            RETURNING *
            ",
        )
        .bind(message_id)
        .bind(status)
        .bind(update.platform_message_id)
        .bind(update.failure_reason)
        .bind(update.attempts)
        .bind(allowed_from)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => {
                let current = self.get_message(message_id).await?;
                Err(StoreError::InvalidTransition {
                    from: current.delivery_status,
                    to: status,
                })
            }
        }
    }

    async fn confirm_delivered(
        &self,
        conversation_id: Uuid,
        platform_message_ids: &[String],
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r"
            UPDATE messages
            SET delivery_status = 'delivered'
            WHERE conversation_id = $1
              AND direction = 'outbound'
              AND delivery_status = 'sent'
              AND platform_message_id = ANY($2)
            RETURNING *
            ",
        )
        .bind(conversation_id)
        .bind(platform_message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_messages(&self, conversation_id: Uuid, page: Page) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r"
            SELECT * FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(conversation_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn messages_recorded_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r"
            SELECT * FROM messages
            WHERE recorded_at > $1
            ORDER BY recorded_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn unfinished_outbound(&self) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r"
            SELECT * FROM messages
            WHERE direction = 'outbound'
              AND delivery_status IN ('pending', 'sent')
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
