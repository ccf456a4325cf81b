//! Outbound Relay
//!
//! Agent replies are persisted as `pending` and handed to a background
//! scheduler, which owns a delay queue of delivery jobs. Each attempt runs on
//! its own task and reports back whether, and after how long, to try again.
//!
//! Status path: `pending -> sent -> delivered`, or `-> failed` on a terminal
//! error or after the last retryable attempt. A failed reply is never
//! resurrected; [`RelayHandle::requeue`] creates a new message instead.

pub mod messenger;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    ConversationStore, DeliveryStatus, Direction, Message, StatusUpdate, StoreError,
};
use crate::notify::NotificationHub;

pub use messenger::{GraphMessenger, Messenger, SendError, SendReceipt};

/// Attempts made to persist a status change before giving up.
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Relay errors surfaced to the agent API.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Only failed outbound messages can be re-queued.
    #[error("Message cannot be retried (status: {})", .status.map_or("none", DeliveryStatus::as_str))]
    NotRetryable { status: Option<DeliveryStatus> },
}

/// Exponential backoff with a capped number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single Send API call.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.relay_max_attempts.max(1),
            base_delay: config.relay_base_delay,
            max_delay: config.relay_max_delay,
            attempt_timeout: config.relay_attempt_timeout,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), before jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) scaled by a random factor in `[0.5, 1.0]`.
    #[must_use]
    pub fn jittered(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        self.backoff(attempt).mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
struct Job {
    message_id: Uuid,
    conversation_id: Uuid,
    recipient_id: String,
    text: String,
    /// Number of the next Send API call, starting at 1.
    attempt: u32,
}

/// Entry point for queuing replies. Cheap to clone.
#[derive(Clone)]
pub struct RelayHandle {
    store: Arc<dyn ConversationStore>,
    notifications: NotificationHub,
    jobs: mpsc::UnboundedSender<Job>,
}

impl RelayHandle {
    /// Persist a reply as `pending` and schedule its delivery.
    ///
    /// Returns as soon as the message is stored; delivery happens in the
    /// background.
    #[instrument(skip(self, text))]
    pub async fn send(
        &self,
        conversation_id: Uuid,
        agent_id: &str,
        text: &str,
    ) -> Result<Message, RelayError> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        let message = self
            .store
            .append_outbound_message(conversation_id, agent_id, text, None)
            .await?;

        self.notifications.publish(conversation_id, &message);
        self.enqueue(&message, conversation.customer_id);
        Ok(message)
    }

    /// Queue a fresh copy of a failed reply. The failed message is kept as is.
    #[instrument(skip(self))]
    pub async fn requeue(&self, message_id: Uuid, agent_id: &str) -> Result<Message, RelayError> {
        let failed = self.store.get_message(message_id).await?;
        if failed.direction != Direction::Outbound
            || failed.delivery_status != Some(DeliveryStatus::Failed)
        {
            return Err(RelayError::NotRetryable {
                status: failed.delivery_status,
            });
        }

        let conversation = self.store.get_conversation(failed.conversation_id).await?;
        let message = self
            .store
            .append_outbound_message(
                conversation.id,
                agent_id,
                failed.text.as_deref().unwrap_or_default(),
                Some(failed.id),
            )
            .await?;

        info!(
            retry_of = %failed.id,
            message_id = %message.id,
            "Failed reply re-queued"
        );
        self.notifications.publish(conversation.id, &message);
        self.enqueue(&message, conversation.customer_id);
        Ok(message)
    }

    /// Re-schedule outbound messages left unfinished by a previous run.
    pub async fn recover_unfinished(&self) -> Result<usize, RelayError> {
        let unfinished = self.store.unfinished_outbound().await?;
        let mut recovered = 0;
        for message in &unfinished {
            match self.store.get_conversation(message.conversation_id).await {
                Ok(conversation) => {
                    self.enqueue(message, conversation.customer_id);
                    recovered += 1;
                }
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Cannot recover outbound message");
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "Re-queued unfinished outbound messages");
        }
        Ok(recovered)
    }

    fn enqueue(&self, message: &Message, recipient_id: String) {
        let job = Job {
            message_id: message.id,
            conversation_id: message.conversation_id,
            recipient_id,
            text: message.text.clone().unwrap_or_default(),
            attempt: 1,
        };
        // The message stays pending and is recovered on the next start.
        if self.jobs.send(job).is_err() {
            error!(message_id = %message.id, "Relay scheduler is not running");
        }
    }
}

/// Start the delivery scheduler and return a handle for queuing replies.
///
/// The scheduler stops once every handle has been dropped.
pub fn spawn_delivery_worker(
    store: Arc<dyn ConversationStore>,
    messenger: Arc<dyn Messenger>,
    notifications: NotificationHub,
    policy: RetryPolicy,
) -> RelayHandle {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let worker = Arc::new(DeliveryWorker {
        store: store.clone(),
        messenger,
        notifications: notifications.clone(),
        policy,
    });

    tokio::spawn(run_scheduler(worker, jobs_rx));
    info!(
        max_attempts = policy.max_attempts,
        "Relay delivery worker started"
    );

    RelayHandle {
        store,
        notifications,
        jobs: jobs_tx,
    }
}

async fn run_scheduler(worker: Arc<DeliveryWorker>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let mut delayed: DelayQueue<Job> = DelayQueue::new();
    let (retry_tx, mut retries) = mpsc::unbounded_channel::<(Job, Duration)>();

    loop {
        tokio::select! {
            received = jobs.recv() => {
                let Some(job) = received else {
                    debug!(pending_retries = delayed.len(), "Relay scheduler stopping");
                    break;
                };
                dispatch(&worker, &retry_tx, job);
            }
            Some((job, delay)) = retries.recv() => {
                delayed.insert(job, delay);
            }
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                dispatch(&worker, &retry_tx, expired.into_inner());
            }
        }
    }
}

fn dispatch(
    worker: &Arc<DeliveryWorker>,
    retry_tx: &mpsc::UnboundedSender<(Job, Duration)>,
    job: Job,
) {
    let worker = worker.clone();
    let retry_tx = retry_tx.clone();
    tokio::spawn(async move {
        let mut job = job;
        if let Some(delay) = worker.attempt(&mut job).await {
            let _ = retry_tx.send((job, delay));
        }
    });
}

struct DeliveryWorker {
    store: Arc<dyn ConversationStore>,
    messenger: Arc<dyn Messenger>,
    notifications: NotificationHub,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    /// Run one delivery attempt. Returns the delay before the next one, if
    /// the job should be retried.
    #[instrument(
        skip(self, job),
        fields(message_id = %job.message_id, attempt = job.attempt)
    )]
    async fn attempt(&self, job: &mut Job) -> Option<Duration> {
        if job.attempt == 1 {
            match self.mark_sent(job).await {
                Some(true) => {}
                Some(false) => return Some(self.policy.jittered(1)),
                None => return None,
            }
        } else if !self.still_sent(job).await {
            return None;
        }

        let sent = tokio::time::timeout(
            self.policy.attempt_timeout,
            self.messenger.send_text(&job.recipient_id, &job.text),
        )
        .await
        .unwrap_or_else(|_| Err(SendError::Retryable("Send attempt timed out".to_string())));

        match sent {
            Ok(receipt) => {
                info!("Reply delivered");
                self.settle(
                    job,
                    DeliveryStatus::Delivered,
                    StatusUpdate {
                        platform_message_id: receipt.message_id,
                        failure_reason: None,
                        attempts: Some(job.attempt as i32),
                    },
                )
                .await;
                None
            }
            Err(SendError::Terminal(reason)) => {
                warn!(reason = %reason, "Reply rejected by messaging API");
                self.fail(job, reason).await;
                None
            }
            Err(SendError::Retryable(reason)) if job.attempt >= self.policy.max_attempts => {
                warn!(reason = %reason, "Reply failed after final attempt");
                self.fail(job, format!("{reason} (gave up after {} attempts)", job.attempt))
                    .await;
                None
            }
            Err(SendError::Retryable(reason)) => {
                let delay = self.policy.jittered(job.attempt);
                warn!(
                    reason = %reason,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reply delivery failed, will retry"
                );
                job.attempt += 1;
                Some(delay)
            }
        }
    }

    /// Move the message to `sent` before its first API call.
    ///
    /// `Some(true)` to proceed, `Some(false)` to retry the write later,
    /// `None` when the message is already settled.
    async fn mark_sent(&self, job: &Job) -> Option<bool> {
        match self
            .store
            .update_delivery_status(job.message_id, DeliveryStatus::Sent, StatusUpdate::default())
            .await
        {
            Ok(message) => {
                self.notifications.publish_status(&message);
                Some(true)
            }
            // Recovered after a restart mid-delivery.
            Err(StoreError::InvalidTransition {
                from: Some(DeliveryStatus::Sent),
                ..
            }) => Some(true),
            Err(StoreError::InvalidTransition { from, .. }) => {
                debug!(status = ?from, "Message already settled, dropping job");
                None
            }
            Err(StoreError::MessageNotFound) => {
                warn!("Queued message no longer exists");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to mark reply sent, will retry");
                Some(false)
            }
        }
    }

    /// Re-read the message before a retry. Stops when it settled meanwhile.
    async fn still_sent(&self, job: &Job) -> bool {
        match self.store.get_message(job.message_id).await {
            Ok(message) => match message.delivery_status {
                Some(DeliveryStatus::Sent) => true,
                status => {
                    debug!(status = ?status, "Message settled before retry, dropping job");
                    false
                }
            },
            Err(StoreError::MessageNotFound) => {
                warn!("Queued message no longer exists");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not re-read message, retrying anyway");
                true
            }
        }
    }

    async fn fail(&self, job: &Job, reason: String) {
        self.settle(
            job,
            DeliveryStatus::Failed,
            StatusUpdate {
                platform_message_id: None,
                failure_reason: Some(reason),
                attempts: Some(job.attempt as i32),
            },
        )
        .await;
    }

    async fn settle(&self, job: &Job, status: DeliveryStatus, update: StatusUpdate) {
        for write in 1..=STATUS_WRITE_ATTEMPTS {
            match self
                .store
                .update_delivery_status(job.message_id, status, update.clone())
                .await
            {
                Ok(message) => {
                    self.notifications.publish_status(&message);
                    return;
                }
                Err(e) if e.is_transient() && write < STATUS_WRITE_ATTEMPTS => {
                    warn!(error = %e, write, "Status write failed, retrying");
                    tokio::time::sleep(self.policy.base_delay.min(Duration::from_secs(1))).await;
                }
                Err(StoreError::InvalidTransition { from, .. }) => {
                    debug!(
                        conversation_id = %job.conversation_id,
                        current = ?from,
                        target = %status,
                        "Status already settled"
                    );
                    return;
                }
                Err(e) => {
                    error!(error = %e, target = %status, "Failed to record delivery status");
                    return;
                }
            }
        }
    }
}
