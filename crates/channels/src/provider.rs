//! Provider-neutral message types and the send contract every message
//! provider honours.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: String,
    pub body: String,
    /// Correlation tags carried into provider logs, e.g. `message_id`.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Result of one send attempt. Retryable conditions (timeouts, rate limits,
/// 5xx, network errors) are kept apart from terminal ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendOutcome {
    Success {
        message_id: String,
    },
    RetryableFailure {
        error_code: String,
        error_message: String,
    },
    TerminalFailure {
        error_code: String,
        error_message: String,
    },
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SendOutcome::RetryableFailure { .. })
    }
}

#[async_trait]
pub trait MessageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, message: &OutboundMessage) -> SendOutcome;
}

/// What came back from a provider HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    Response {
        status: u16,
        body: serde_json::Value,
    },
    /// No response was received.
    NetworkError {
        code: Option<String>,
        message: String,
    },
}

/// HTTP boundary used by the bundled providers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &serde_json::Value,
    ) -> ProviderReply;
}

/// Status codes every bundled provider treats as retryable.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

pub(crate) fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}
