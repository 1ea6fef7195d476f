//! Storage boundaries used by the engine and the query layer.
//!
//! Every call takes the workspace id explicitly; implementations must never
//! return rows from another workspace.

mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;

use audience_core::error::EngineResult;
use audience_core::types::{ComputedPropertyStep, ResourceKind, UserEvent, UserSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluator::ManualMembership;

pub use memory::{
    InMemoryAssignmentStore, InMemoryEventStore, InMemoryHistoryStore,
    InMemoryManualMembershipStore, InMemoryPeriodStore,
};

/// Result of evaluating one computed property for one individual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AssignmentValue {
    Segment(bool),
    UserProperty(serde_json::Value),
}

impl AssignmentValue {
    pub fn kind(&self) -> ResourceKind {
        match self {
            AssignmentValue::Segment(_) => ResourceKind::Segment,
            AssignmentValue::UserProperty(_) => ResourceKind::UserProperty,
        }
    }

    pub fn in_segment(&self) -> Option<bool> {
        match self {
            AssignmentValue::Segment(v) => Some(*v),
            AssignmentValue::UserProperty(_) => None,
        }
    }
}

/// Current materialized state for `(workspace, user, computed property)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub workspace_id: Uuid,
    pub user_id: String,
    pub computed_property_id: Uuid,
    pub value: AssignmentValue,
    pub max_event_time: Option<DateTime<Utc>>,
    pub assigned_at: DateTime<Utc>,
}

/// Append-only mirror of an assignment write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub workspace_id: Uuid,
    pub user_id: String,
    pub computed_property_id: Uuid,
    pub value: AssignmentValue,
    pub max_event_time: Option<DateTime<Utc>>,
    pub assigned_at: DateTime<Utc>,
}

impl From<&Assignment> for HistoryRecord {
    fn from(a: &Assignment) -> Self {
        Self {
            workspace_id: a.workspace_id,
            user_id: a.user_id.clone(),
            computed_property_id: a.computed_property_id,
            value: a.value.clone(),
            max_event_time: a.max_event_time,
            assigned_at: a.assigned_at,
        }
    }
}

/// A completed recompute window for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedPropertyPeriod {
    pub workspace_id: Uuid,
    pub step: ComputedPropertyStep,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: DateTime<Utc>,
    /// Wall-clock time the period was recorded.
    pub created_at: DateTime<Utc>,
    /// Event-store append sequence covered by the period.
    #[serde(default)]
    pub sequence: u64,
}

pub trait EventStore: Send + Sync {
    /// Appends events, assigning each a per-workspace sequence number. An
    /// event is readable before its sequence becomes visible through
    /// `high_watermark`.
    fn append(&self, events: Vec<UserEvent>) -> EngineResult<()>;

    /// Highest sequence assigned in the workspace, 0 before any append.
    fn high_watermark(&self, workspace_id: Uuid) -> EngineResult<u64>;

    /// Users with events whose sequence is in `(after, until]`, whatever their
    /// `received_at`. Catches events stamped before a window closed but
    /// appended after it was scanned.
    fn users_appended(
        &self,
        workspace_id: Uuid,
        after: u64,
        until: u64,
    ) -> EngineResult<BTreeSet<String>>;

    /// Users with events received in `(after, until]`.
    fn users_with_activity(
        &self,
        workspace_id: Uuid,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> EngineResult<BTreeSet<String>>;

    /// Every user with at least one event received by `until`.
    fn all_users(&self, workspace_id: Uuid, until: DateTime<Utc>) -> EngineResult<BTreeSet<String>>;

    fn snapshot(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> EngineResult<UserSnapshot>;

    /// Bulk delete used by workspace resets. Returns the number of events removed.
    fn delete_workspace(&self, workspace_id: Uuid) -> EngineResult<usize>;
}

pub trait AssignmentStore: Send + Sync {
    fn get(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        computed_property_id: Uuid,
    ) -> EngineResult<Option<Assignment>>;

    /// Upserts on `(workspace, user, computed property)`.
    fn upsert_batch(&self, assignments: &[Assignment]) -> EngineResult<()>;

    fn list_for_user(&self, workspace_id: Uuid, user_id: &str) -> EngineResult<Vec<Assignment>>;

    fn list_for_workspace(&self, workspace_id: Uuid) -> EngineResult<Vec<Assignment>>;

    /// Users holding any assignment row for the computed property.
    fn users_assigned(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngineResult<BTreeSet<String>>;
}

pub trait HistoryStore: Send + Sync {
    /// Appends records, skipping any whose `(max_event_time, value)` equals
    /// the latest stored record for the same `(workspace, user, computed
    /// property)`. Returns the number of rows appended.
    fn insert_batch(&self, records: &[HistoryRecord]) -> EngineResult<usize>;

    /// All records for one computed property, in insertion order.
    fn records_for(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngineResult<Vec<HistoryRecord>>;
}

pub trait PeriodStore: Send + Sync {
    fn latest(
        &self,
        workspace_id: Uuid,
        step: ComputedPropertyStep,
    ) -> EngineResult<Option<ComputedPropertyPeriod>>;

    /// Records a period. Fails with `PeriodRegression` when `period_end`
    /// precedes the latest recorded end for the same step.
    fn record(&self, period: ComputedPropertyPeriod) -> EngineResult<()>;
}

pub trait ManualMembershipStore: Send + Sync {
    fn replace(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        version: i64,
        user_ids: BTreeSet<String>,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    fn get(&self, workspace_id: Uuid, segment_id: Uuid) -> EngineResult<Option<ManualMembership>>;
}

/// The set of stores the engine and query layer share.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub history: Arc<dyn HistoryStore>,
    pub periods: Arc<dyn PeriodStore>,
    pub manual: Arc<dyn ManualMembershipStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventStore::new()),
            assignments: Arc::new(InMemoryAssignmentStore::new()),
            history: Arc::new(InMemoryHistoryStore::new()),
            periods: Arc::new(InMemoryPeriodStore::new()),
            manual: Arc::new(InMemoryManualMembershipStore::new()),
        }
    }
}
