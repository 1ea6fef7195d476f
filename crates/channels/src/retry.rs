//! Retry loop over the provider contract. Only `RetryableFailure` outcomes
//! are retried; terminal failures return immediately.

use std::time::Duration;

use audience_core::config::DeliveryConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::{MessageProvider, OutboundMessage, SendOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub outcome: SendOutcome,
    pub attempts: u32,
}

pub async fn deliver(
    provider: &dyn MessageProvider,
    message: &OutboundMessage,
    policy: RetryPolicy,
) -> DeliveryReport {
    let mut attempt = 0;
    loop {
        attempt += 1;
        metrics::counter!("delivery.attempts", "provider" => provider.name()).increment(1);
        let outcome = provider.send(message).await;
        if !outcome.is_retryable() || attempt >= policy.max_attempts {
            if outcome.is_success() {
                info!(provider = provider.name(), attempts = attempt, "Message delivered");
            }
            return DeliveryReport {
                outcome,
                attempts: attempt,
            };
        }
        let delay = policy.backoff(attempt);
        metrics::counter!("delivery.retries", "provider" => provider.name()).increment(1);
        warn!(
            provider = provider.name(),
            attempt,
            delay_ms = millis(delay),
            "Retryable send failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
