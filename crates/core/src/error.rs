use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::ComputedPropertyStep;

pub type EngineResult<T> = Result<T, EngineError>;

/// Infrastructure failures. Any of these aborts the running batch without
/// advancing its period, so the next run retries the same window.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store call timed out: {0}")]
    Timeout(String),

    #[error("Period for step {step} would regress from {previous} to {attempted}")]
    PeriodRegression {
        step: ComputedPropertyStep,
        previous: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient errors are eligible for automatic retry by the scheduler.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Timeout(_))
    }
}
