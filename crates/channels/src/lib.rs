//! Outbound message-provider boundary.
//!
//! Providers report every attempt as a `SendOutcome`; `deliver` retries the
//! retryable ones with exponential backoff.

pub mod brevo;
pub mod provider;
pub mod retry;
pub mod whatsapp;

pub use brevo::{BrevoConfig, BrevoProvider};
pub use provider::{MessageProvider, OutboundMessage, ProviderReply, SendOutcome, Transport};
pub use retry::{deliver, DeliveryReport, RetryPolicy};
pub use whatsapp::{WhatsAppCloudConfig, WhatsAppCloudProvider};
