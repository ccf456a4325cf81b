//! Messaging API Client
//!
//! Sends agent replies to customers through the platform's Send API and
//! classifies failures as retryable or terminal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Platform error codes that indicate a temporary condition.
const TRANSIENT_ERROR_CODES: [i64; 7] = [1, 2, 4, 17, 32, 613, 1200];

/// Why a send attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Timeouts (including 408), connection errors, 5xx and rate limits.
    #[error("{0}")]
    Retryable(String),
    /// Invalid recipient, revoked permission or any other rejected request.
    #[error("{0}")]
    Terminal(String),
}

impl SendError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Successful send acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SendReceipt {
    /// Platform message id of the delivered reply.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Outbound transport for agent replies.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, recipient_id: &str, text: &str) -> Result<SendReceipt, SendError>;
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    error: GraphError,
}

#[derive(Debug, Default, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    is_transient: bool,
}

/// Classify a non-success Send API response.
#[must_use]
pub fn classify(status: StatusCode, body: &str) -> SendError {
    let parsed: GraphErrorBody = serde_json::from_str(body).unwrap_or_default();
    let error = parsed.error;
    let description = match (error.code, error.message.as_deref()) {
        (Some(code), Some(message)) => format!("HTTP {}: ({code}) {message}", status.as_u16()),
        (None, Some(message)) => format!("HTTP {}: {message}", status.as_u16()),
        _ => format!("HTTP {}", status.as_u16()),
    };

    let transient_code = error
        .code
        .is_some_and(|code| TRANSIENT_ERROR_CODES.contains(&code));

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || transient_code
        || error.is_transient
    {
        SendError::Retryable(description)
    } else {
        SendError::Terminal(description)
    }
}

/// Send API client authenticated with a page access token.
#[derive(Clone)]
pub struct GraphMessenger {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl GraphMessenger {
    pub fn new(
        base_url: &str,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/me/messages", base_url.trim_end_matches('/')),
            access_token: access_token.into(),
        })
    }
}

#[async_trait]
impl Messenger for GraphMessenger {
    async fn send_text(&self, recipient_id: &str, text: &str) -> Result<SendReceipt, SendError> {
        let body = json!({
            "recipient": { "id": recipient_id },
            "messaging_type": "RESPONSE",
            "message": { "text": text },
        });

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("access_token", self.access_token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    SendError::Terminal(format!("Invalid request: {e}"))
                } else {
                    SendError::Retryable(format!("Request failed: {}", e.without_url()))
                }
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            // The reply was accepted even if the body is unexpected.
            return Ok(serde_json::from_str(&text).unwrap_or_default());
        }
        Err(classify(status, &text))
    }
}
