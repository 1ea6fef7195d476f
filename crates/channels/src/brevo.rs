//! Brevo transactional SMS.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use crate::provider::{
    is_success_status, MessageProvider, OutboundMessage, ProviderReply, SendOutcome, Transport,
    RETRYABLE_STATUS_CODES,
};

pub const BREVO_API_URL: &str = "https://api.brevo.com/v3/transactionalSMS/sms";

#[derive(Debug, Clone)]
pub struct BrevoConfig {
    pub api_key: String,
    pub sender: String,
}

pub struct BrevoProvider<T> {
    config: BrevoConfig,
    transport: T,
}

impl<T: Transport> BrevoProvider<T> {
    pub fn new(config: BrevoConfig, transport: T) -> Self {
        Self { config, transport }
    }
}

fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn classify(reply: ProviderReply) -> SendOutcome {
    match reply {
        ProviderReply::Response { status, body } if is_success_status(status) => {
            let id = ["messageId", "reference"]
                .iter()
                .find_map(|key| body.get(*key).and_then(id_string));
            match id {
                Some(message_id) => SendOutcome::Success { message_id },
                None => SendOutcome::RetryableFailure {
                    error_code: "missing_message_id".into(),
                    error_message: "Brevo response missing message ID".into(),
                },
            }
        }
        ProviderReply::Response { status, body } => {
            let error_code = body
                .get("code")
                .and_then(|c| c.as_str())
                .unwrap_or("UNKNOWN")
                .to_string();
            let error_message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error")
                .to_string();
            if RETRYABLE_STATUS_CODES.contains(&status) {
                SendOutcome::RetryableFailure {
                    error_code,
                    error_message,
                }
            } else {
                SendOutcome::TerminalFailure {
                    error_code,
                    error_message,
                }
            }
        }
        ProviderReply::NetworkError { code, message } => SendOutcome::RetryableFailure {
            error_code: code.unwrap_or_else(|| "UNKNOWN".into()),
            error_message: message,
        },
    }
}

#[async_trait]
impl<T: Transport> MessageProvider for BrevoProvider<T> {
    fn name(&self) -> &'static str {
        "brevo"
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        let mut body = json!({
            "sender": self.config.sender,
            "recipient": message.recipient,
            "content": message.body,
        });
        if let Some(tag) = message.tags.get("message_id") {
            body["tag"] = json!(tag);
        }
        let headers = [
            ("api-key", self.config.api_key.clone()),
            ("Content-Type", "application/json".to_string()),
        ];
        let outcome = classify(self.transport.post_json(BREVO_API_URL, &headers, &body).await);
        match &outcome {
            SendOutcome::Success { message_id } => {
                debug!(message_id = %message_id, tags = ?message.tags, "Brevo SMS sent");
            }
            SendOutcome::RetryableFailure { error_code, error_message }
            | SendOutcome::TerminalFailure { error_code, error_message } => {
                error!(
                    error_code = %error_code,
                    error_message = %error_message,
                    retryable = outcome.is_retryable(),
                    tags = ?message.tags,
                    "Brevo SMS send failed"
                );
            }
        }
        outcome
    }
}
