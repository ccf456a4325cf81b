//! Agent Notification Channel
//!
//! Fans out new messages and delivery status changes to connected agents.
//! Delivery is best-effort: the channel keeps a bounded buffer, slow
//! subscribers skip what they missed, and a reconnecting dashboard re-reads
//! recent history from the conversation store.

pub mod handlers;

use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{Action, SessionContext, SessionGate};
use crate::db::{DeliveryStatus, Message};

/// Events buffered per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Server-to-agent events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A message was stored (inbound from a customer or a queued reply).
    MessageCreated {
        conversation_id: Uuid,
        message: Message,
    },
    /// An outbound message changed delivery status.
    DeliveryStatusChanged {
        conversation_id: Uuid,
        message_id: Uuid,
        status: DeliveryStatus,
        failure_reason: Option<String>,
    },
}

impl Notification {
    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        match self {
            Self::MessageCreated {
                conversation_id, ..
            }
            | Self::DeliveryStatusChanged {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// In-process publish/subscribe hub.
#[derive(Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Announce a newly stored message. Never fails.
    pub fn publish(&self, conversation_id: Uuid, message: &Message) {
        self.send(Notification::MessageCreated {
            conversation_id,
            message: message.clone(),
        });
    }

    /// Announce the current delivery status of an outbound message.
    pub fn publish_status(&self, message: &Message) {
        let Some(status) = message.delivery_status else {
            return;
        };
        self.send(Notification::DeliveryStatusChanged {
            conversation_id: message.conversation_id,
            message_id: message.id,
            status,
            failure_reason: message.failure_reason.clone(),
        });
    }

    fn send(&self, notification: Notification) {
        // An error only means nobody is listening right now.
        if self.sender.send(notification).is_err() {
            debug!("No notification subscribers");
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribe on behalf of an agent session.
    ///
    /// Yields only notifications the gate lets the session read, and ends
    /// when the session expires or the hub is dropped. Each call starts a
    /// fresh subscription with no replay.
    pub fn subscribe(
        &self,
        session: SessionContext,
        gate: SessionGate,
    ) -> impl Stream<Item = Notification> + Send + 'static {
        let receiver = self.sender.subscribe();

        stream::unfold(
            (receiver, session, gate),
            |(mut receiver, session, gate)| async move {
                loop {
                    let remaining = (session.expires_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        debug!(agent_id = %session.agent_id, "Session expired, closing notification stream");
                        return None;
                    }

                    let received = tokio::select! {
                        received = receiver.recv() => received,
                        () = tokio::time::sleep(remaining) => continue,
                    };

                    match received {
                        Ok(notification) => {
                            let allowed = gate
                                .authorize(&session, notification.conversation_id(), Action::Read)
                                .is_allowed();
                            if allowed {
                                return Some((notification, (receiver, session, gate)));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                agent_id = %session.agent_id,
                                skipped,
                                "Notification subscriber lagged; client should re-fetch"
                            );
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        )
    }
}
