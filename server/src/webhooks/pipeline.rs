//! Inbound Ingestion Pipeline
//!
//! One webhook delivery moves through
//! `received -> verified -> dedup-checked -> stored -> notified -> acknowledged`,
//! or `received -> rejected` when the signature does not verify. Every event
//! in a batched delivery is handled independently; a duplicate short-cuts
//! from `dedup-checked` straight to acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use super::dedup::EventDeduplicator;
use super::events::{parse_delivery, DeliveryReceipt, InboundEvent, PAGE_OBJECT};
use super::signing;
use crate::db::{conversation_id_for, ConversationStore, Message, StoreError};
use crate::notify::NotificationHub;

/// Reasons a delivery is not acknowledged with success.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Subscription object this server does not handle.
    #[error("Unsupported webhook object: {0}")]
    UnsupportedObject(String),

    /// The store could not be written; the platform should redeliver.
    #[error("Store unavailable: {0}")]
    Infrastructure(#[from] StoreError),
}

/// Pipeline stages, logged as each event advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Verified,
    Rejected,
    DedupChecked,
    Stored,
    Notified,
    Acknowledged,
}

impl Stage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::DedupChecked => "dedup-checked",
            Self::Stored => "stored",
            Self::Notified => "notified",
            Self::Acknowledged => "acknowledged",
        }
    }
}

/// Per-delivery tally returned to the webhook handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// New messages written to the store.
    pub stored: usize,
    /// Events recognised as redeliveries.
    pub duplicates: usize,
    /// Delivery receipts applied.
    pub receipts: usize,
    /// Events with nothing to store (echoes, reads, unknown kinds, other pages).
    pub skipped: usize,
}

enum EventOutcome {
    Stored(Message),
    Duplicate,
    Receipt(Vec<Message>),
    Skipped,
}

/// Verifies, deduplicates, stores and announces inbound webhook events.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn ConversationStore>,
    dedup: Arc<dyn EventDeduplicator>,
    notifications: NotificationHub,
    app_secret: String,
    dedup_timeout: Duration,
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        dedup: Arc<dyn EventDeduplicator>,
        notifications: NotificationHub,
        app_secret: impl Into<String>,
        dedup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dedup,
            notifications,
            app_secret: app_secret.into(),
            dedup_timeout,
        }
    }

    /// Run one webhook delivery through the pipeline.
    ///
    /// `raw_body` must be the exact bytes received. When `path_page` is set,
    /// entries addressed to other pages are skipped. Succeeds once every
    /// event is handled, duplicates included; fails with
    /// [`IngestError::Infrastructure`] if any event could not be stored, after
    /// the remaining events have still been attempted.
    #[instrument(skip_all, fields(path_page = path_page, body_len = raw_body.len()))]
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        path_page: Option<&str>,
    ) -> Result<IngestReport, IngestError> {
        debug!(stage = Stage::Received.as_str(), "Webhook delivery received");

        if !signing::verify(raw_body, signature_header, &self.app_secret) {
            warn!(
                stage = Stage::Rejected.as_str(),
                has_signature = signature_header.is_some(),
                "Webhook signature verification failed"
            );
            return Err(IngestError::InvalidSignature);
        }
        debug!(stage = Stage::Verified.as_str(), "Webhook signature verified");

        let delivery = parse_delivery(raw_body)?;
        if delivery.object != PAGE_OBJECT {
            return Err(IngestError::UnsupportedObject(delivery.object));
        }

        let mut report = IngestReport::default();
        let mut failure = None;

        for event in &delivery.events {
            if path_page.is_some_and(|page| page != event.page_id()) {
                debug!(page_id = event.page_id(), "Skipping event for another page");
                report.skipped += 1;
                continue;
            }

            match self.process_event(event).await {
                Ok(EventOutcome::Stored(_)) => report.stored += 1,
                Ok(EventOutcome::Duplicate) => report.duplicates += 1,
                Ok(EventOutcome::Receipt(_)) => report.receipts += 1,
                Ok(EventOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(
                        kind = event.kind(),
                        delivery_id = event.delivery_id().as_deref(),
                        error = %e,
                        "Failed to ingest webhook event"
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e.into());
        }

        debug!(
            stage = Stage::Acknowledged.as_str(),
            stored = report.stored,
            duplicates = report.duplicates,
            receipts = report.receipts,
            skipped = report.skipped,
            "Webhook delivery acknowledged"
        );
        Ok(report)
    }

    async fn process_event(&self, event: &InboundEvent) -> Result<EventOutcome, StoreError> {
        let Some(delivery_id) = event.delivery_id() else {
            debug!(kind = event.kind(), "Ignoring unhandled event");
            return Ok(EventOutcome::Skipped);
        };

        if !self.claim(&delivery_id).await {
            debug!(delivery_id = %delivery_id, "Duplicate delivery acknowledged");
            return Ok(EventOutcome::Duplicate);
        }
        debug!(stage = Stage::DedupChecked.as_str(), delivery_id = %delivery_id, "Event claimed");

        let applied = match event {
            InboundEvent::Delivery(receipt) => self.apply_receipt(receipt).await,
            _ => self.store_message(event).await,
        };

        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release(&delivery_id).await;
                return Err(e);
            }
        };

        self.finalize(&delivery_id).await;
        self.announce(&outcome);
        Ok(outcome)
    }

    async fn store_message(&self, event: &InboundEvent) -> Result<EventOutcome, StoreError> {
        let Some(new_message) = event.to_new_message() else {
            return Ok(EventOutcome::Skipped);
        };

        let conversation = self
            .store
            .upsert_conversation(event.page_id(), &new_message.customer_id)
            .await?;

        match self
            .store
            .append_inbound_message(conversation.id, new_message)
            .await
        {
            Ok(message) => {
                debug!(
                    stage = Stage::Stored.as_str(),
                    conversation_id = %conversation.id,
                    message_id = %message.id,
                    "Inbound message stored"
                );
                Ok(EventOutcome::Stored(message))
            }
            Err(StoreError::DuplicateMessage {
                platform_message_id,
            }) => {
                debug!(
                    conversation_id = %conversation.id,
                    platform_message_id = %platform_message_id,
                    "Message already recorded"
                );
                Ok(EventOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_receipt(&self, receipt: &DeliveryReceipt) -> Result<EventOutcome, StoreError> {
        // Receipts never open conversations.
        let conversation_id = conversation_id_for(&receipt.page_id, &receipt.customer_id);
        match self.store.get_conversation(conversation_id).await {
            Ok(_) => {}
            Err(StoreError::ConversationNotFound) => {
                debug!(conversation_id = %conversation_id, "Receipt for unknown conversation");
                return Ok(EventOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }
        if receipt.mids.is_empty() {
            return Ok(EventOutcome::Receipt(Vec::new()));
        }

        let promoted = self
            .store
            .confirm_delivered(conversation_id, &receipt.mids)
            .await?;

        if !promoted.is_empty() {
            debug!(
                conversation_id = %conversation_id,
                promoted = promoted.len(),
                "Delivery receipt applied"
            );
        }
        Ok(EventOutcome::Receipt(promoted))
    }

    fn announce(&self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Stored(message) => {
                self.notifications.publish(message.conversation_id, message);
                debug!(
                    stage = Stage::Notified.as_str(),
                    message_id = %message.id,
                    "Agents notified"
                );
            }
            EventOutcome::Receipt(promoted) => {
                for message in promoted {
                    self.notifications.publish_status(message);
                }
            }
            EventOutcome::Duplicate | EventOutcome::Skipped => {}
        }
    }

    /// Claim a delivery id. A slow or failing deduplicator does not block
    /// ingestion: the event is processed and the store's uniqueness on
    /// platform message ids catches repeats.
    async fn claim(&self, delivery_id: &str) -> bool {
        match tokio::time::timeout(self.dedup_timeout, self.dedup.should_process(delivery_id))
            .await
        {
            Ok(Ok(claimed)) => claimed,
            Ok(Err(e)) => {
                warn!(delivery_id, error = %e, "Dedup check failed, processing event");
                true
            }
            Err(_) => {
                warn!(delivery_id, "Dedup check timed out, processing event");
                true
            }
        }
    }

    async fn finalize(&self, delivery_id: &str) {
        match tokio::time::timeout(self.dedup_timeout, self.dedup.mark_processed(delivery_id))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(delivery_id, error = %e, "Failed to mark event processed"),
            Err(_) => warn!(delivery_id, "Timed out marking event processed"),
        }
    }

    async fn release(&self, delivery_id: &str) {
        match tokio::time::timeout(self.dedup_timeout, self.dedup.release(delivery_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(delivery_id, error = %e, "Failed to release event claim"),
            Err(_) => warn!(delivery_id, "Timed out releasing event claim"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures::StreamExt;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::auth::{SessionContext, SessionGate};
    use crate::db::{
        Conversation, ConversationStatus, DeliveryStatus,
        MemoryConversationStore, NewInboundMessage, Page, StatusUpdate, StoreResult,
    };
    use crate::notify::Notification;
    use crate::webhooks::dedup::{DedupError, MemoryEventDeduplicator};

    const SECRET: &str = "pipeline-secret";

    fn message_event(customer: &str, mid: &str, text: &str, ts: i64) -> serde_json::Value {
        json!({
            "sender": { "id": customer },
            "recipient": { "id": "PAGE" },
            "timestamp": ts,
            "message": { "mid": mid, "text": text }
        })
    }

    fn body(page: &str, events: Vec<serde_json::Value>) -> Vec<u8> {
        json!({
            "object": "page",
            "entry": [{ "id": page, "time": 1_700_000_000_000_i64, "messaging": events }]
        })
        .to_string()
        .into_bytes()
    }

    fn signed(body: &[u8]) -> String {
        signing::sign_payload(SECRET, body)
    }

    fn pipeline_with(
        store: Arc<dyn ConversationStore>,
        dedup: Arc<dyn EventDeduplicator>,
        hub: NotificationHub,
    ) -> IngestionPipeline {
        IngestionPipeline::new(store, dedup, hub, SECRET, Duration::from_millis(200))
    }

    fn live_session() -> SessionContext {
        SessionContext {
            session_id: "s".into(),
            agent_id: "agent".into(),
            agent_name: "Agent".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn rejects_bad_signature_without_touching_store() {
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );
        let raw = body("PAGE", vec![message_event("CUST", "m1", "hi", 1)]);

        let mut tampered = raw.clone();
        tampered[10] ^= 0x01;
        let result = pipeline.ingest(&tampered, Some(&signed(&raw)), None).await;
        assert!(matches!(result, Err(IngestError::InvalidSignature)));

        let result = pipeline.ingest(&raw, None, None).await;
        assert!(matches!(result, Err(IngestError::InvalidSignature)));

        let conversations = store.list_conversations(None, Page::default()).await.unwrap();
        assert!(conversations.is_empty());
    }

    #[tokio::test]
    async fn batched_events_share_one_conversation_in_timestamp_order() {
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );
        // Newer event first: stored order must follow the payload timestamps.
        let raw = body(
            "PAGE",
            vec![
                message_event("CUST", "m2", "second", 2_000),
                message_event("CUST", "m1", "first", 1_000),
            ],
        );

        let report = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        assert_eq!(report.stored, 2);

        let conversations = store.list_conversations(None, Page::default()).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, conversation_id_for("PAGE", "CUST"));

        let messages = store
            .list_messages(conversations[0].id, Page::default())
            .await
            .unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_deref()).collect();
        assert_eq!(texts, vec![Some("first"), Some("second")]);
        assert_eq!(messages[0].created_at.timestamp_millis(), 1_000);
    }

    #[tokio::test]
    async fn redelivery_is_acknowledged_without_side_effects() {
        let store = Arc::new(MemoryConversationStore::new());
        let hub = NotificationHub::new();
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            hub.clone(),
        );
        let mut notifications = Box::pin(hub.subscribe(live_session(), SessionGate::default()));
        let raw = body("PAGE", vec![message_event("CUST", "m1", "hi", 1_000)]);

        let first = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        let second = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        assert_eq!(first.stored, 1);
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 1);

        let conversation_id = conversation_id_for("PAGE", "CUST");
        let messages = store
            .list_messages(conversation_id, Page::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);

        // Exactly one notification for the stored message.
        assert!(matches!(
            notifications.next().await,
            Some(Notification::MessageCreated { .. })
        ));
        let extra =
            tokio::time::timeout(Duration::from_millis(50), notifications.next()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn malformed_and_foreign_payloads_are_rejected() {
        let pipeline = pipeline_with(
            Arc::new(MemoryConversationStore::new()),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );

        let raw = b"{not json".to_vec();
        let result = pipeline.ingest(&raw, Some(&signed(&raw)), None).await;
        assert!(matches!(result, Err(IngestError::MalformedPayload(_))));

        let raw = json!({ "object": "instagram", "entry": [] }).to_string().into_bytes();
        let result = pipeline.ingest(&raw, Some(&signed(&raw)), None).await;
        assert!(matches!(result, Err(IngestError::UnsupportedObject(o)) if o == "instagram"));
    }

    #[tokio::test]
    async fn path_page_skips_other_pages_and_unhandled_events() {
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );
        let raw = body(
            "OTHER",
            vec![message_event("CUST", "m1", "hi", 1_000)],
        );
        let report = pipeline
            .ingest(&raw, Some(&signed(&raw)), Some("PAGE"))
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);

        let raw = body(
            "PAGE",
            vec![json!({ "sender": { "id": "CUST" }, "timestamp": 5, "read": { "watermark": 5 } })],
        );
        let report = pipeline
            .ingest(&raw, Some(&signed(&raw)), Some("PAGE"))
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);

        assert!(store
            .list_conversations(None, Page::default())
            .await
            .unwrap()
            .is_empty());
    }

    fn receipt_event(customer: &str, mids: &[&str], watermark: i64) -> serde_json::Value {
        json!({
            "sender": { "id": customer },
            "timestamp": watermark,
            "delivery": { "mids": mids, "watermark": watermark }
        })
    }

    #[tokio::test]
    async fn delivery_receipt_confirms_only_listed_replies() {
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );
        let conversation = store.upsert_conversation("PAGE", "CUST").await.unwrap();
        let accepted = store
            .append_outbound_message(conversation.id, "agent", "on it", None)
            .await
            .unwrap();
        let retrying = store
            .append_outbound_message(conversation.id, "agent", "still trying", None)
            .await
            .unwrap();
        store
            .update_delivery_status(
                accepted.id,
                DeliveryStatus::Sent,
                StatusUpdate {
                    platform_message_id: Some("m_out_1".into()),
                    ..StatusUpdate::default()
                },
            )
            .await
            .unwrap();
        store
            .update_delivery_status(retrying.id, DeliveryStatus::Sent, StatusUpdate::default())
            .await
            .unwrap();

        // A watermark past both replies only confirms the listed mid.
        let watermark = Utc::now().timestamp_millis() + 1_000;
        let raw = body("PAGE", vec![receipt_event("CUST", &["m_out_1"], watermark)]);
        let report = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        assert_eq!(report.receipts, 1);

        let accepted = store.get_message(accepted.id).await.unwrap();
        assert_eq!(accepted.delivery_status, Some(DeliveryStatus::Delivered));
        let retrying = store.get_message(retrying.id).await.unwrap();
        assert_eq!(retrying.delivery_status, Some(DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn receipt_for_unknown_customer_opens_no_conversation() {
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );

        let raw = body("PAGE", vec![receipt_event("NEWCUST", &["m_x"], 1_700_000_000_000)]);
        let report = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        assert_eq!(report.receipts, 0);
        assert_eq!(report.skipped, 1);

        assert!(store
            .list_conversations(None, Page::default())
            .await
            .unwrap()
            .is_empty());
    }

    /// Deduplicator that always errors.
    struct BrokenDedup;

    #[async_trait]
    impl EventDeduplicator for BrokenDedup {
        async fn should_process(&self, _: &str) -> Result<bool, DedupError> {
            Err(DedupError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn mark_processed(&self, _: &str) -> Result<(), DedupError> {
            Err(DedupError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn release(&self, _: &str) -> Result<(), DedupError> {
            Ok(())
        }
        async fn prune(&self, _: u32) -> Result<u64, DedupError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn broken_dedup_falls_back_to_store_idempotence() {
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(BrokenDedup), NotificationHub::new());
        let raw = body("PAGE", vec![message_event("CUST", "m1", "hi", 1_000)]);

        let first = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        let second = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        assert_eq!(first.stored, 1);
        assert_eq!(second.duplicates, 1);

        let messages = store
            .list_messages(conversation_id_for("PAGE", "CUST"), Page::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    /// Store whose inbound appends fail while `down` is set.
    struct FlakyStore {
        inner: MemoryConversationStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl ConversationStore for FlakyStore {
        async fn upsert_conversation(&self, page: &str, customer: &str) -> StoreResult<Conversation> {
            self.inner.upsert_conversation(page, customer).await
        }
        async fn get_conversation(&self, id: Uuid) -> StoreResult<Conversation> {
            self.inner.get_conversation(id).await
        }
        async fn list_conversations(
            &self,
            status: Option<ConversationStatus>,
            page: Page,
        ) -> StoreResult<Vec<Conversation>> {
            self.inner.list_conversations(status, page).await
        }
        async fn set_conversation_status(
            &self,
            id: Uuid,
            status: ConversationStatus,
        ) -> StoreResult<Conversation> {
            self.inner.set_conversation_status(id, status).await
        }
        async fn append_inbound_message(
            &self,
            id: Uuid,
            message: NewInboundMessage,
        ) -> StoreResult<Message> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.append_inbound_message(id, message).await
        }
        async fn append_outbound_message(
            &self,
            id: Uuid,
            agent_id: &str,
            text: &str,
            retry_of: Option<Uuid>,
        ) -> StoreResult<Message> {
            self.inner
                .append_outbound_message(id, agent_id, text, retry_of)
                .await
        }
        async fn get_message(&self, id: Uuid) -> StoreResult<Message> {
            self.inner.get_message(id).await
        }
        async fn update_delivery_status(
            &self,
            id: Uuid,
            status: DeliveryStatus,
            update: StatusUpdate,
        ) -> StoreResult<Message> {
            self.inner.update_delivery_status(id, status, update).await
        }
        async fn confirm_delivered(
            &self,
            id: Uuid,
            platform_message_ids: &[String],
        ) -> StoreResult<Vec<Message>> {
            self.inner.confirm_delivered(id, platform_message_ids).await
        }
        async fn list_messages(&self, id: Uuid, page: Page) -> StoreResult<Vec<Message>> {
            self.inner.list_messages(id, page).await
        }
        async fn messages_recorded_since(
            &self,
            since: DateTime<Utc>,
            limit: i64,
        ) -> StoreResult<Vec<Message>> {
            self.inner.messages_recorded_since(since, limit).await
        }
        async fn unfinished_outbound(&self) -> StoreResult<Vec<Message>> {
            self.inner.unfinished_outbound().await
        }
    }

    #[tokio::test]
    async fn store_failure_surfaces_and_redelivery_is_processed() {
        let store = Arc::new(FlakyStore {
            inner: MemoryConversationStore::new(),
            down: AtomicBool::new(true),
        });
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(MemoryEventDeduplicator::new()),
            NotificationHub::new(),
        );
        let raw = body(
            "PAGE",
            vec![
                message_event("CUST", "m1", "one", 1_000),
                message_event("CUST", "m2", "two", 2_000),
            ],
        );

        let result = pipeline.ingest(&raw, Some(&signed(&raw)), None).await;
        assert!(matches!(result, Err(IngestError::Infrastructure(_))));

        store.down.store(false, Ordering::SeqCst);
        let report = pipeline.ingest(&raw, Some(&signed(&raw)), None).await.unwrap();
        assert_eq!(report.stored, 2);
        assert_eq!(report.duplicates, 0);
    }
}
