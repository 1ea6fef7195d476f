//! Staleness tracking over recorded computed-property periods.

use std::sync::Arc;

use audience_core::error::EngineResult;
use audience_core::types::ComputedPropertyStep;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::PeriodStore;

/// A step whose last recompute is at least this old is stale.
pub const STALE_AFTER_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    NotComputed,
    Stale { last_recomputed: DateTime<Utc> },
    UpToDate { last_recomputed: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPeriod {
    pub step: ComputedPropertyStep,
    pub last_recomputed: Option<DateTime<Utc>>,
}

/// Read-only view of the period store. Only the engine records periods.
pub struct StalenessTracker {
    periods: Arc<dyn PeriodStore>,
}

impl StalenessTracker {
    pub fn new(periods: Arc<dyn PeriodStore>) -> Self {
        Self { periods }
    }

    pub fn last_recomputed(
        &self,
        workspace_id: Uuid,
        step: ComputedPropertyStep,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        Ok(self.periods.latest(workspace_id, step)?.map(|p| p.created_at))
    }

    pub fn freshness(
        &self,
        workspace_id: Uuid,
        step: ComputedPropertyStep,
        now: DateTime<Utc>,
    ) -> EngineResult<Freshness> {
        Ok(classify(self.last_recomputed(workspace_id, step)?, now))
    }

    pub fn periods(&self, workspace_id: Uuid) -> EngineResult<Vec<StepPeriod>> {
        ComputedPropertyStep::ALL
            .iter()
            .map(|&step| -> EngineResult<StepPeriod> {
                Ok(StepPeriod {
                    step,
                    last_recomputed: self.last_recomputed(workspace_id, step)?,
                })
            })
            .collect()
    }
}

fn classify(last_recomputed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
    match last_recomputed {
        None => Freshness::NotComputed,
        Some(last) if now - last >= Duration::seconds(STALE_AFTER_SECS) => Freshness::Stale {
            last_recomputed: last,
        },
        Some(last) => Freshness::UpToDate {
            last_recomputed: last,
        },
    }
}
