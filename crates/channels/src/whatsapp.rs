//! WhatsApp Cloud API text messages.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use crate::provider::{
    is_success_status, MessageProvider, OutboundMessage, ProviderReply, SendOutcome, Transport,
    RETRYABLE_STATUS_CODES,
};

pub const WHATSAPP_API_VERSION: &str = "v21.0";

/// Graph API error codes worth retrying: unknown, user and app call limits,
/// rate limit, business account throttled, temporary policy block.
pub const WHATSAPP_RETRYABLE_ERROR_CODES: [i64; 6] = [4, 17, 32, 80007, 131031, 368];

#[derive(Debug, Clone)]
pub struct WhatsAppCloudConfig {
    pub access_token: String,
    pub phone_number_id: String,
}

pub struct WhatsAppCloudProvider<T> {
    config: WhatsAppCloudConfig,
    transport: T,
}

impl<T: Transport> WhatsAppCloudProvider<T> {
    pub fn new(config: WhatsAppCloudConfig, transport: T) -> Self {
        Self { config, transport }
    }

    pub fn url(&self) -> String {
        format!(
            "https://graph.facebook.com/{}/{}/messages",
            WHATSAPP_API_VERSION, self.config.phone_number_id
        )
    }
}

/// Strips everything but digits.
pub fn normalize_phone_number(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

pub fn request_body(to: &str, body: &str) -> serde_json::Value {
    json!({
        "messaging_product": "whatsapp",
        "to": normalize_phone_number(to),
        "type": "text",
        "text": { "body": body },
    })
}

fn is_retryable(error_code: Option<i64>, status: Option<u16>) -> bool {
    match (error_code, status) {
        (None, None) => true,
        (code, status) => {
            status.is_some_and(|s| RETRYABLE_STATUS_CODES.contains(&s))
                || code.is_some_and(|c| WHATSAPP_RETRYABLE_ERROR_CODES.contains(&c))
        }
    }
}

pub fn classify(reply: ProviderReply) -> SendOutcome {
    match reply {
        ProviderReply::Response { status, body } if is_success_status(status) => {
            match body.pointer("/messages/0/id").and_then(|id| id.as_str()) {
                Some(id) => SendOutcome::Success {
                    message_id: id.to_string(),
                },
                None => SendOutcome::RetryableFailure {
                    error_code: "missing_message_id".into(),
                    error_message: "WhatsApp Cloud API response missing message ID".into(),
                },
            }
        }
        ProviderReply::Response { status, body } => {
            let error = body.get("error");
            let code = error
                .and_then(|e| e.get("code"))
                .and_then(|c| c.as_i64())
                .filter(|c| *c != 0);
            let message = error
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            let kind = error
                .and_then(|e| e.get("type"))
                .and_then(|t| t.as_str())
                .unwrap_or("Unknown");
            failure(
                is_retryable(code, Some(status)),
                code.unwrap_or(0).to_string(),
                format!("{}: {}", kind, message),
            )
        }
        ProviderReply::NetworkError { code, message } => {
            let numeric = code
                .as_deref()
                .and_then(|c| c.parse::<i64>().ok())
                .filter(|c| *c != 0);
            failure(
                is_retryable(numeric, None),
                numeric.unwrap_or(0).to_string(),
                format!("Unknown: {}", message),
            )
        }
    }
}

fn failure(retryable: bool, error_code: String, error_message: String) -> SendOutcome {
    if retryable {
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

#[async_trait]
impl<T: Transport> MessageProvider for WhatsAppCloudProvider<T> {
    fn name(&self) -> &'static str {
        "whatsapp_cloud"
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        let headers = [
            ("Authorization", format!("Bearer {}", self.config.access_token)),
            ("Content-Type", "application/json".to_string()),
        ];
        let reply = self
            .transport
            .post_json(&self.url(), &headers, &request_body(&message.recipient, &message.body))
            .await;
        let outcome = classify(reply);
        match &outcome {
            SendOutcome::Success { message_id } => {
                debug!(message_id = %message_id, tags = ?message.tags, "WhatsApp Cloud message sent");
            }
            SendOutcome::RetryableFailure { error_code, error_message }
            | SendOutcome::TerminalFailure { error_code, error_message } => {
                error!(
                    error_code = %error_code,
                    error_message = %error_message,
                    retryable = outcome.is_retryable(),
                    tags = ?message.tags,
                    "WhatsApp Cloud send failed"
                );
            }
        }
        outcome
    }
}
