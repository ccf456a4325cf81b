//! Inbound Platform Events
//!
//! A webhook delivery carries one or more entries, each batching several
//! messaging events. Events are parsed into [`InboundEvent`]; shapes this
//! server does not act on become [`InboundEvent::Unhandled`] instead of
//! failing the whole delivery.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::db::NewInboundMessage;

/// The only subscription object this server handles.
pub const PAGE_OBJECT: &str = "page";

#[derive(Debug, Deserialize)]
struct RawDelivery {
    object: String,
    #[serde(default)]
    entry: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: String,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    messaging: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawParty {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawMessaging {
    sender: RawParty,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    postback: Option<RawPostback>,
    #[serde(default)]
    delivery: Option<RawReceipt>,
    #[serde(default)]
    read: Option<RawReceipt>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    mid: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
    #[serde(default)]
    attachments: Option<Value>,
    #[serde(default)]
    quick_reply: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawPostback {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReceipt {
    watermark: i64,
    #[serde(default)]
    mids: Vec<String>,
}

/// A parsed webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookDelivery {
    pub object: String,
    pub events: Vec<InboundEvent>,
}

/// Customer text (and attachments) sent to the page.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub page_id: String,
    pub customer_id: String,
    pub mid: String,
    pub text: Option<String>,
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Customer tapped a button or menu item.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPostback {
    pub page_id: String,
    pub customer_id: String,
    pub mid: Option<String>,
    pub title: Option<String>,
    pub payload: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Platform confirmation that page messages reached the customer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub page_id: String,
    pub customer_id: String,
    /// Platform ids of the confirmed messages. May be empty.
    pub mids: Vec<String>,
    pub watermark: DateTime<Utc>,
}

/// One event inside a webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(IncomingMessage),
    Postback(IncomingPostback),
    Delivery(DeliveryReceipt),
    /// Read receipts, echoes of page messages, and unknown kinds.
    Unhandled {
        page_id: String,
        kind: String,
        raw: Value,
    },
}

impl InboundEvent {
    /// Identifier used to recognise redeliveries of this event.
    pub fn delivery_id(&self) -> Option<String> {
        match self {
            Self::Message(m) => Some(m.mid.clone()),
            Self::Postback(p) => Some(p.mid.clone().unwrap_or_else(|| {
                format!(
                    "postback:{}:{}",
                    p.customer_id,
                    p.timestamp.timestamp_millis()
                )
            })),
            Self::Delivery(d) => Some(format!(
                "delivery:{}:{}",
                d.customer_id,
                d.watermark.timestamp_millis()
            )),
            Self::Unhandled { .. } => None,
        }
    }

    pub fn page_id(&self) -> &str {
        match self {
            Self::Message(m) => &m.page_id,
            Self::Postback(p) => &p.page_id,
            Self::Delivery(d) => &d.page_id,
            Self::Unhandled { page_id, .. } => page_id,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::Postback(_) => "postback",
            Self::Delivery(_) => "delivery",
            Self::Unhandled { kind, .. } => kind,
        }
    }

    /// The conversation message this event stores, if any.
    pub fn to_new_message(&self) -> Option<NewInboundMessage> {
        match self {
            Self::Message(m) => Some(NewInboundMessage {
                platform_message_id: m.mid.clone(),
                customer_id: m.customer_id.clone(),
                text: m.text.clone(),
                payload: m.payload.clone(),
                timestamp: m.timestamp,
            }),
            Self::Postback(p) => Some(NewInboundMessage {
                platform_message_id: self.delivery_id()?,
                customer_id: p.customer_id.clone(),
                text: p.title.clone(),
                payload: Some(serde_json::json!({ "postback": p.payload })),
                timestamp: p.timestamp,
            }),
            Self::Delivery(_) | Self::Unhandled { .. } => None,
        }
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Parse a raw webhook body.
///
/// Fails only when the envelope itself is not valid JSON of the expected
/// shape; individual events that do not parse become `Unhandled`.
pub fn parse_delivery(raw_body: &[u8]) -> Result<WebhookDelivery, serde_json::Error> {
    let raw: RawDelivery = serde_json::from_slice(raw_body)?;

    let mut events = Vec::new();
    for entry in raw.entry {
        let entry_time = entry.time.and_then(millis_to_datetime);
        for item in entry.messaging {
            events.push(parse_event(&entry.id, entry_time, item));
        }
    }

    Ok(WebhookDelivery {
        object: raw.object,
        events,
    })
}

fn parse_event(page_id: &str, entry_time: Option<DateTime<Utc>>, item: Value) -> InboundEvent {
    let unhandled = |kind: &str, raw: Value| InboundEvent::Unhandled {
        page_id: page_id.to_string(),
        kind: kind.to_string(),
        raw,
    };

    let parsed: RawMessaging = match serde_json::from_value(item.clone()) {
        Ok(parsed) => parsed,
        Err(_) => return unhandled("malformed", item),
    };

    let event_time = parsed.timestamp.and_then(millis_to_datetime).or(entry_time);
    let timestamp = event_time.unwrap_or_else(Utc::now);
    let customer_id = parsed.sender.id;

    if let Some(message) = parsed.message {
        if message.is_echo {
            return unhandled("echo", item);
        }
        let payload = match (message.attachments, message.quick_reply) {
            (None, None) => None,
            (attachments, quick_reply) => Some(serde_json::json!({
                "attachments": attachments,
                "quick_reply": quick_reply,
            })),
        };
        return InboundEvent::Message(IncomingMessage {
            page_id: page_id.to_string(),
            customer_id,
            mid: message.mid,
            text: message.text,
            payload,
            timestamp,
        });
    }

    if let Some(postback) = parsed.postback {
        // Without a mid the redelivery key comes from the event time.
        if postback.mid.is_none() && event_time.is_none() {
            return unhandled("postback", item);
        }
        return InboundEvent::Postback(IncomingPostback {
            page_id: page_id.to_string(),
            customer_id,
            mid: postback.mid,
            title: postback.title,
            payload: postback.payload,
            timestamp,
        });
    }

    if let Some(receipt) = parsed.delivery {
        if let Some(watermark) = millis_to_datetime(receipt.watermark) {
            return InboundEvent::Delivery(DeliveryReceipt {
                page_id: page_id.to_string(),
                customer_id,
                mids: receipt.mids,
                watermark,
            });
        }
        return unhandled("delivery", item);
    }

    if parsed.read.is_some() {
        return unhandled("read", item);
    }

    unhandled("unknown", item)
}
