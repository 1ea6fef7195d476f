//! Incremental assignment engine: evaluates every definition in a workspace
//! for the individuals whose data changed since the last recorded period,
//! writes the delta, then advances the period.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use audience_core::config::ManualVersionPolicy;
use audience_core::error::EngineResult;
use audience_core::types::{ComputedPropertyStep, UserSnapshot};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::computed::evaluate_user_property;
use crate::definition::SegmentTree;
use crate::evaluator::{evaluate_segment, EvalContext, EvaluationError, ManualMembership};
use crate::registry::{DefinitionRegistry, Segment, SegmentStatus, UserProperty};
use crate::store::{Assignment, AssignmentValue, ComputedPropertyPeriod, HistoryRecord, Stores};

const STEP: ComputedPropertyStep = ComputedPropertyStep::ComputeAssignments;

/// `(start, end]` on event receipt time. `start` is `None` for the first run.
/// The append sequence range `(after_sequence, until_sequence]` covers events
/// stamped inside an earlier window but stored after it was scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub after_sequence: u64,
    #[serde(default)]
    pub until_sequence: u64,
}

impl ComputeWindow {
    fn contains_change(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at > start)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeReport {
    pub window: ComputeWindow,
    pub users_evaluated: usize,
    pub assignments_written: usize,
    pub history_inserted: usize,
    pub evaluation_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(ComputeReport),
    /// Another run already holds the `(workspace, step)` key.
    Coalesced,
}

enum Target {
    Segment {
        segment: Segment,
        tree: SegmentTree,
        manual: Option<ManualMembership>,
    },
    Property(UserProperty),
}

impl Target {
    fn id(&self) -> Uuid {
        match self {
            Target::Segment { segment, .. } => segment.id,
            Target::Property(p) => p.id,
        }
    }

    fn evaluate(
        &self,
        snapshot: &UserSnapshot,
        policy: ManualVersionPolicy,
    ) -> Result<Option<AssignmentValue>, EvaluationError> {
        match self {
            Target::Segment { tree, manual, .. } => {
                let ctx = EvalContext::new(snapshot).with_manual(manual.as_ref(), policy);
                evaluate_segment(tree, &ctx).map(|v| Some(AssignmentValue::Segment(v)))
            }
            Target::Property(p) => Ok(evaluate_user_property(&p.definition, snapshot)?
                .map(AssignmentValue::UserProperty)),
        }
    }
}

pub struct AssignmentEngine {
    registry: Arc<DefinitionRegistry>,
    stores: Stores,
    policy: ManualVersionPolicy,
    locks: DashMap<(Uuid, ComputedPropertyStep), Arc<Mutex<()>>>,
    last_assigned: DashMap<Uuid, DateTime<Utc>>,
}

impl AssignmentEngine {
    pub fn new(registry: Arc<DefinitionRegistry>, stores: Stores, policy: ManualVersionPolicy) -> Self {
        Self {
            registry,
            stores,
            policy,
            locks: DashMap::new(),
            last_assigned: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn lock_for(&self, workspace_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry((workspace_id, STEP))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs the next window for the workspace, waiting for any in-flight run
    /// on the same key to finish first.
    pub fn compute_assignments(&self, workspace_id: Uuid, now: DateTime<Utc>) -> EngineResult<ComputeReport> {
        let lock = self.lock_for(workspace_id);
        let _guard = lock.lock();
        let window = self.next_window(workspace_id, now)?;
        self.execute(workspace_id, window)
    }

    /// Like `compute_assignments`, but returns `Coalesced` instead of waiting
    /// when a run is already in flight.
    pub fn try_compute_assignments(&self, workspace_id: Uuid, now: DateTime<Utc>) -> EngineResult<RunOutcome> {
        let lock = self.lock_for(workspace_id);
        let Some(_guard) = lock.try_lock() else {
            metrics::counter!("computed_properties.coalesced_runs").increment(1);
            warn!(workspace_id = %workspace_id, step = %STEP, "Recompute already running, coalescing");
            return Ok(RunOutcome::Coalesced);
        };
        let window = self.next_window(workspace_id, now)?;
        self.execute(workspace_id, window).map(RunOutcome::Completed)
    }

    /// Runs an explicit window. Re-running an already applied window is a
    /// no-op for assignments and history.
    pub fn run_window(&self, workspace_id: Uuid, window: ComputeWindow) -> EngineResult<ComputeReport> {
        let lock = self.lock_for(workspace_id);
        let _guard = lock.lock();
        self.execute(workspace_id, window)
    }

    /// Scheduler entry point: one coalescing run per known workspace.
    pub fn compute_all(&self, now: DateTime<Utc>) -> Vec<(Uuid, EngineResult<RunOutcome>)> {
        self.registry
            .workspaces()
            .into_iter()
            .map(|ws| (ws, self.try_compute_assignments(ws, now)))
            .collect()
    }

    fn next_window(&self, workspace_id: Uuid, now: DateTime<Utc>) -> EngineResult<ComputeWindow> {
        let latest = self.stores.periods.latest(workspace_id, STEP)?;
        let start = latest.as_ref().map(|p| p.period_end);
        let after_sequence = latest.as_ref().map_or(0, |p| p.sequence);
        let until_sequence = self.stores.events.high_watermark(workspace_id)?.max(after_sequence);
        // Clock skew must never move the window end behind the recorded one.
        let end = start.map_or(now, |start| now.max(start));
        Ok(ComputeWindow {
            start,
            end,
            after_sequence,
            until_sequence,
        })
    }

    /// First `assigned_at` for a batch of `count` rows. Rows get consecutive
    /// microseconds from it, and every batch starts after the previous one
    /// ended, so the recently-updated cursor never sees ties.
    fn reserve_assigned_at(&self, workspace_id: Uuid, count: usize) -> DateTime<Utc> {
        let mut last = self.last_assigned.entry(workspace_id).or_insert_with(Utc::now);
        let base = Utc::now().max(*last + Duration::microseconds(1));
        let span = i64::try_from(count).unwrap_or(i64::MAX).saturating_sub(1).max(0);
        *last = base + Duration::microseconds(span);
        base
    }

    fn execute(&self, workspace_id: Uuid, window: ComputeWindow) -> EngineResult<ComputeReport> {
        metrics::counter!("computed_properties.batches").increment(1);
        match self.compute_and_write(workspace_id, window) {
            Ok(report) => {
                metrics::counter!("computed_properties.assignments_written")
                    .increment(report.assignments_written as u64);
                info!(
                    workspace_id = %workspace_id,
                    step = %STEP,
                    users = report.users_evaluated,
                    written = report.assignments_written,
                    history = report.history_inserted,
                    errors = report.evaluation_errors,
                    period_end = %window.end,
                    "Computed assignments"
                );
                Ok(report)
            }
            Err(e) => {
                metrics::counter!("computed_properties.batch_failures").increment(1);
                error!(
                    workspace_id = %workspace_id,
                    step = %STEP,
                    error = %e,
                    transient = e.is_transient(),
                    "Assignment batch failed, period not advanced"
                );
                Err(e)
            }
        }
    }

    fn compute_and_write(&self, workspace_id: Uuid, window: ComputeWindow) -> EngineResult<ComputeReport> {
        let population = self.plan(workspace_id, window)?;
        let targets = population.targets;

        let mut assignments = Vec::new();
        let mut evaluation_errors = 0;

        for (user_id, indexes) in &population.users {
            let snapshot = self.stores.events.snapshot(workspace_id, user_id, window.end)?;
            for &i in indexes {
                let target = &targets[i];
                let computed = match target.evaluate(&snapshot, self.policy) {
                    Ok(v) => v,
                    Err(e) => {
                        evaluation_errors += 1;
                        metrics::counter!("computed_properties.evaluation_errors").increment(1);
                        warn!(
                            workspace_id = %workspace_id,
                            user_id = %user_id,
                            computed_property_id = %target.id(),
                            error = %e,
                            "Skipping evaluation"
                        );
                        continue;
                    }
                };

                let existing = self.stores.assignments.get(workspace_id, user_id, target.id())?;
                let value = match (computed, &existing) {
                    (Some(v), _) => v,
                    // A property that lost its value is cleared, never created empty.
                    (None, Some(prev)) if prev.value != AssignmentValue::UserProperty(serde_json::Value::Null) => {
                        AssignmentValue::UserProperty(serde_json::Value::Null)
                    }
                    (None, _) => continue,
                };
                if existing.as_ref().is_some_and(|prev| prev.value == value) {
                    continue;
                }
                assignments.push(Assignment {
                    workspace_id,
                    user_id: user_id.clone(),
                    computed_property_id: target.id(),
                    value,
                    max_event_time: snapshot.max_event_time,
                    assigned_at: window.end,
                });
            }
        }
        if !assignments.is_empty() {
            let base = self.reserve_assigned_at(workspace_id, assignments.len());
            for (offset, assignment) in (0..).zip(assignments.iter_mut()) {
                assignment.assigned_at = base + Duration::microseconds(offset);
            }
        }

        let history: Vec<HistoryRecord> = assignments.iter().map(HistoryRecord::from).collect();
        let history_inserted = self.stores.history.insert_batch(&history)?;
        self.stores.assignments.upsert_batch(&assignments)?;
        self.stores.periods.record(ComputedPropertyPeriod {
            workspace_id,
            step: STEP,
            period_start: window.start,
            period_end: window.end,
            sequence: window.until_sequence,
            created_at: Utc::now(),
        })?;

        Ok(ComputeReport {
            window,
            users_evaluated: population.users.len(),
            assignments_written: assignments.len(),
            history_inserted,
            evaluation_errors,
        })
    }

    /// Chooses which individuals each definition is evaluated for.
    fn plan(&self, workspace_id: Uuid, window: ComputeWindow) -> EngineResult<Population> {
        let mut active = self
            .stores
            .events
            .users_with_activity(workspace_id, window.start, window.end)?;
        active.extend(self.stores.events.users_appended(
            workspace_id,
            window.after_sequence,
            window.until_sequence,
        )?);
        let mut everyone: Option<BTreeSet<String>> = None;
        let mut population = Population::default();

        for segment in self.registry.list_segments(workspace_id) {
            let tree = match segment.tree() {
                Ok(tree) => tree,
                Err(e) => {
                    warn!(segment_id = %segment.id, error = %e, "Stored segment definition is invalid");
                    continue;
                }
            };
            let manual = if tree.references_manual() {
                self.stores.manual.get(workspace_id, segment.id)?
            } else {
                None
            };
            let definition_changed = window.contains_change(segment.definition_updated_at);
            let list_changed = manual
                .as_ref()
                .is_some_and(|m| window.contains_change(m.updated_at));

            let users = if segment.status == SegmentStatus::NotStarted {
                if !definition_changed && !list_changed {
                    debug!(segment_id = %segment.id, "Manual segment unchanged, skipping");
                    continue;
                }
                let mut users = self.stores.assignments.users_assigned(workspace_id, segment.id)?;
                if let Some(m) = &manual {
                    users.extend(m.user_ids.iter().cloned());
                }
                users
            } else if definition_changed || list_changed || tree.depends_on_time() {
                let mut users = self.everyone(workspace_id, window.end, &mut everyone)?;
                users.extend(self.stores.assignments.users_assigned(workspace_id, segment.id)?);
                if let Some(m) = &manual {
                    users.extend(m.user_ids.iter().cloned());
                }
                users
            } else {
                active.clone()
            };
            population.add(
                Target::Segment {
                    segment,
                    tree,
                    manual,
                },
                users,
            );
        }

        for property in self.registry.list_user_properties(workspace_id) {
            let users = if window.contains_change(property.definition_updated_at)
                || property.definition.depends_on_time()
            {
                let mut users = self.everyone(workspace_id, window.end, &mut everyone)?;
                users.extend(self.stores.assignments.users_assigned(workspace_id, property.id)?);
                users
            } else {
                active.clone()
            };
            population.add(Target::Property(property), users);
        }

        debug!(
            workspace_id = %workspace_id,
            active = active.len(),
            targets = population.targets.len(),
            users = population.users.len(),
            "Planned assignment batch"
        );
        Ok(population)
    }

    fn everyone(
        &self,
        workspace_id: Uuid,
        until: DateTime<Utc>,
        cache: &mut Option<BTreeSet<String>>,
    ) -> EngineResult<BTreeSet<String>> {
        if let Some(users) = cache {
            return Ok(users.clone());
        }
        let users = self.stores.events.all_users(workspace_id, until)?;
        *cache = Some(users.clone());
        Ok(users)
    }
}

/// Definitions to evaluate, and per user the indexes of the definitions that
/// apply to them.
#[derive(Default)]
struct Population {
    targets: Vec<Target>,
    users: BTreeMap<String, Vec<usize>>,
}

impl Population {
    fn add(&mut self, target: Target, users: BTreeSet<String>) {
        let index = self.targets.len();
        self.targets.push(target);
        for user in users {
            self.users.entry(user).or_default().push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SegmentBuilder;
    use crate::computed::UserPropertyDefinition;
    use crate::registry::{UpsertSegment, UpsertUserProperty};
    use crate::store::{AssignmentStore, InMemoryAssignmentStore};
    use audience_core::error::EngineError;
    use audience_core::types::UserEvent;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        ws: Uuid,
        engine: AssignmentEngine,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_stores(Stores::in_memory())
        }

        fn with_stores(stores: Stores) -> Self {
            Self {
                ws: Uuid::new_v4(),
                engine: AssignmentEngine::new(
                    Arc::new(DefinitionRegistry::new()),
                    stores,
                    ManualVersionPolicy::Strict,
                ),
            }
        }

        fn segment(&self, name: &str, builder: SegmentBuilder) -> Segment {
            self.engine
                .registry()
                .upsert_segment(UpsertSegment {
                    workspace_id: self.ws,
                    id: None,
                    name: name.into(),
                    definition: builder.build().unwrap(),
                })
                .unwrap()
        }

        fn identify(&self, user: &str, traits: serde_json::Value, at: DateTime<Utc>) {
            self.engine
                .stores()
                .events
                .append(vec![UserEvent::identify(self.ws, user, traits, at)])
                .unwrap();
        }

        fn assignment(&self, user: &str, id: Uuid) -> Option<AssignmentValue> {
            self.engine
                .stores()
                .assignments
                .get(self.ws, user, id)
                .unwrap()
                .map(|a| a.value)
        }
    }

    #[test]
    fn test_first_run_evaluates_everyone() {
        let f = Fixture::new();
        let now = Utc::now();
        let segment = f.segment("named-test", SegmentBuilder::new().trait_equals("name", json!("test")));
        f.identify("u1", json!({"name": "test"}), now - Duration::seconds(5));
        f.identify("u2", json!({"name": "other"}), now - Duration::seconds(5));

        let report = f.engine.compute_assignments(f.ws, now).unwrap();
        assert_eq!(report.window.start, None);
        assert_eq!(report.users_evaluated, 2);
        assert_eq!(report.assignments_written, 2);
        assert_eq!(f.assignment("u1", segment.id), Some(AssignmentValue::Segment(true)));
        assert_eq!(f.assignment("u2", segment.id), Some(AssignmentValue::Segment(false)));
    }

    #[test]
    fn test_incremental_run_only_touches_active_users() {
        let f = Fixture::new();
        f.segment("named-test", SegmentBuilder::new().trait_equals("name", json!("test")));
        let t0 = Utc::now();
        f.identify("u1", json!({"name": "test"}), t0 - Duration::seconds(1));
        f.identify("u2", json!({"name": "other"}), t0 - Duration::seconds(1));
        f.engine.compute_assignments(f.ws, t0).unwrap();

        f.identify("u2", json!({"name": "test"}), t0 + Duration::seconds(30));
        let report = f.engine.compute_assignments(f.ws, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(report.window.start, Some(t0));
        assert_eq!(report.users_evaluated, 1);
        assert_eq!(report.assignments_written, 1);
        assert_eq!(report.history_inserted, 1);
    }

    #[test]
    fn test_rerunning_a_window_is_idempotent() {
        let f = Fixture::new();
        let now = Utc::now();
        let segment = f.segment("s", SegmentBuilder::new().trait_exists("email"));
        f.identify("u1", json!({"email": "a@b.c"}), now - Duration::seconds(1));

        let first = f.engine.compute_assignments(f.ws, now).unwrap();
        let second = f.engine.run_window(f.ws, first.window).unwrap();
        assert_eq!(second.users_evaluated, first.users_evaluated);
        assert_eq!(second.assignments_written, 0);
        assert_eq!(second.history_inserted, 0);
        let history = f.engine.stores().history.records_for(f.ws, segment.id).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_period_end_never_regresses() {
        let f = Fixture::new();
        let now = Utc::now();
        f.segment("s", SegmentBuilder::new().trait_exists("email"));
        f.engine.compute_assignments(f.ws, now).unwrap();

        // A skewed clock clamps to the recorded end.
        let report = f.engine.compute_assignments(f.ws, now - Duration::minutes(5)).unwrap();
        assert_eq!(report.window.end, now);

        let err = f
            .engine
            .run_window(
                f.ws,
                ComputeWindow {
                    start: None,
                    end: now - Duration::minutes(5),
                    after_sequence: 0,
                    until_sequence: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::PeriodRegression { .. }));
    }

    #[test]
    fn test_windowed_membership_expires_without_new_events() {
        let f = Fixture::new();
        let recent = f.segment("recent-buyers", SegmentBuilder::new().performed("purchase", 1, Some(60)));
        let lapsed = f.segment("lapsed", SegmentBuilder::new().did_not_perform("purchase", Some(60)));
        let t0 = Utc::now();
        f.engine
            .stores()
            .events
            .append(vec![UserEvent::track(f.ws, "u1", "purchase", json!({}), t0)])
            .unwrap();

        f.engine.compute_assignments(f.ws, t0 + Duration::seconds(1)).unwrap();
        assert_eq!(f.assignment("u1", recent.id), Some(AssignmentValue::Segment(true)));
        assert_eq!(f.assignment("u1", lapsed.id), Some(AssignmentValue::Segment(false)));

        let report = f.engine.compute_assignments(f.ws, t0 + Duration::hours(1)).unwrap();
        assert_eq!(report.users_evaluated, 1);
        assert_eq!(f.assignment("u1", recent.id), Some(AssignmentValue::Segment(false)));
        assert_eq!(f.assignment("u1", lapsed.id), Some(AssignmentValue::Segment(true)));
    }

    #[test]
    fn test_late_append_is_picked_up_by_next_window() {
        let f = Fixture::new();
        let segment = f.segment("named-test", SegmentBuilder::new().trait_equals("name", json!("test")));
        let t0 = Utc::now();
        f.identify("u1", json!({"name": "test"}), t0 - Duration::seconds(5));
        let first = f.engine.compute_assignments(f.ws, t0).unwrap();
        assert_eq!(first.window.until_sequence, 1);

        // Stamped inside the first window, stored after it was scanned.
        f.identify("u2", json!({"name": "test"}), t0 - Duration::seconds(1));
        let second = f.engine.compute_assignments(f.ws, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(second.window.after_sequence, 1);
        assert_eq!(second.window.until_sequence, 2);
        assert_eq!(second.users_evaluated, 1);
        assert_eq!(f.assignment("u2", segment.id), Some(AssignmentValue::Segment(true)));

        let third = f.engine.compute_assignments(f.ws, t0 + Duration::minutes(2)).unwrap();
        assert_eq!(third.users_evaluated, 0);
    }

    #[test]
    fn test_assigned_at_is_unique_and_increasing() {
        let f = Fixture::new();
        let segment = f.segment("s", SegmentBuilder::new().trait_exists("email"));
        let property = f
            .engine
            .registry()
            .upsert_user_property(UpsertUserProperty {
                workspace_id: f.ws,
                id: None,
                name: "email".into(),
                definition: UserPropertyDefinition::Trait { path: "email".into() },
            })
            .unwrap();
        let t0 = Utc::now();
        for user in ["u1", "u2", "u3"] {
            f.identify(user, json!({"email": format!("{user}@example.com")}), t0 - Duration::seconds(1));
        }
        f.engine.compute_assignments(f.ws, t0).unwrap();
        f.identify("u4", json!({"email": "u4@example.com"}), t0 + Duration::seconds(1));
        f.engine.compute_assignments(f.ws, t0 + Duration::minutes(1)).unwrap();

        let mut stamps: Vec<_> = f
            .engine
            .stores()
            .assignments
            .list_for_workspace(f.ws)
            .unwrap()
            .into_iter()
            .filter(|a| a.computed_property_id == segment.id || a.computed_property_id == property.id)
            .map(|a| a.assigned_at)
            .collect();
        assert_eq!(stamps.len(), 8);
        stamps.sort();
        stamps.dedup();
        assert_eq!(stamps.len(), 8);

        let first_batch = f.engine.stores().assignments.get(f.ws, "u3", segment.id).unwrap().unwrap();
        let second_batch = f.engine.stores().assignments.get(f.ws, "u4", segment.id).unwrap().unwrap();
        assert!(second_batch.assigned_at > first_batch.assigned_at);
    }

    #[test]
    fn test_definition_change_reevaluates_full_population() {
        let f = Fixture::new();
        let t0 = Utc::now() - Duration::minutes(10);
        let segment = f.segment("s", SegmentBuilder::new().trait_equals("plan", json!("pro")));
        f.identify("u1", json!({"plan": "free"}), t0 - Duration::seconds(1));
        f.engine.compute_assignments(f.ws, t0).unwrap();
        assert_eq!(f.assignment("u1", segment.id), Some(AssignmentValue::Segment(false)));

        f.engine
            .registry()
            .upsert_segment(UpsertSegment {
                workspace_id: f.ws,
                id: Some(segment.id),
                name: "s".into(),
                definition: SegmentBuilder::new()
                    .trait_equals("plan", json!("free"))
                    .build()
                    .unwrap(),
            })
            .unwrap();
        // No new events, yet the changed definition is applied to u1.
        f.engine.compute_assignments(f.ws, Utc::now()).unwrap();
        assert_eq!(f.assignment("u1", segment.id), Some(AssignmentValue::Segment(true)));
    }

    #[test]
    fn test_manual_segment_follows_uploaded_list() {
        let f = Fixture::new();
        let registry = f.engine.registry();
        let segment = registry
            .upsert_segment(UpsertSegment {
                workspace_id: f.ws,
                id: None,
                name: "manual".into(),
                definition: SegmentBuilder::manual(1),
            })
            .unwrap();
        let t0 = Utc::now();
        f.engine
            .stores()
            .manual
            .replace(f.ws, segment.id, 1, ["u1".to_string()].into(), t0 - Duration::seconds(1))
            .unwrap();
        f.engine.compute_assignments(f.ws, t0).unwrap();
        assert_eq!(f.assignment("u1", segment.id), Some(AssignmentValue::Segment(true)));

        // Unchanged list: not re-evaluated even when members are active.
        f.identify("u1", json!({"x": 1}), t0 + Duration::seconds(1));
        let report = f.engine.compute_assignments(f.ws, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(report.assignments_written, 0);

        // Replacing the list removes u1.
        let t1 = t0 + Duration::minutes(2);
        f.engine
            .stores()
            .manual
            .replace(f.ws, segment.id, 1, ["u2".to_string()].into(), t1)
            .unwrap();
        f.engine.compute_assignments(f.ws, t1 + Duration::seconds(1)).unwrap();
        assert_eq!(f.assignment("u1", segment.id), Some(AssignmentValue::Segment(false)));
        assert_eq!(f.assignment("u2", segment.id), Some(AssignmentValue::Segment(true)));
    }

    #[test]
    fn test_user_property_values_and_clearing() {
        let f = Fixture::new();
        let property = f
            .engine
            .registry()
            .upsert_user_property(UpsertUserProperty {
                workspace_id: f.ws,
                id: None,
                name: "email".into(),
                definition: UserPropertyDefinition::Trait { path: "email".into() },
            })
            .unwrap();
        let t0 = Utc::now();
        f.identify("u1", json!({"email": "a@b.c"}), t0 - Duration::seconds(1));
        f.identify("u2", json!({}), t0 - Duration::seconds(1));
        f.engine.compute_assignments(f.ws, t0).unwrap();
        assert_eq!(
            f.assignment("u1", property.id),
            Some(AssignmentValue::UserProperty(json!("a@b.c")))
        );
        assert_eq!(f.assignment("u2", property.id), None);

        f.identify("u1", json!({"email": null}), t0 + Duration::seconds(1));
        f.engine.compute_assignments(f.ws, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(
            f.assignment("u1", property.id),
            Some(AssignmentValue::UserProperty(serde_json::Value::Null))
        );
    }

    #[test]
    fn test_evaluation_errors_are_isolated() {
        let f = Fixture::new();
        let sum = f
            .engine
            .registry()
            .upsert_user_property(UpsertUserProperty {
                workspace_id: f.ws,
                id: None,
                name: "spend".into(),
                definition: UserPropertyDefinition::Sum {
                    event: "purchase".into(),
                    property: "amount".into(),
                    within_seconds: None,
                },
            })
            .unwrap();
        let now = Utc::now();
        let at = now - Duration::seconds(1);
        f.engine
            .stores()
            .events
            .append(vec![
                UserEvent::track(f.ws, "bad", "purchase", json!({"amount": "lots"}), at),
                UserEvent::track(f.ws, "good", "purchase", json!({"amount": 12}), at),
            ])
            .unwrap();

        let report = f.engine.compute_assignments(f.ws, now).unwrap();
        assert_eq!(report.evaluation_errors, 1);
        assert_eq!(f.assignment("bad", sum.id), None);
        assert_eq!(
            f.assignment("good", sum.id),
            Some(AssignmentValue::UserProperty(json!(12.0)))
        );
    }

    /// Assignment store that fails writes while `failing` is set.
    struct FlakyAssignments {
        inner: InMemoryAssignmentStore,
        failing: AtomicBool,
    }

    impl AssignmentStore for FlakyAssignments {
        fn get(&self, ws: Uuid, user: &str, id: Uuid) -> EngineResult<Option<Assignment>> {
            self.inner.get(ws, user, id)
        }
        fn upsert_batch(&self, assignments: &[Assignment]) -> EngineResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::Timeout("assignment upsert".into()));
            }
            self.inner.upsert_batch(assignments)
        }
        fn list_for_user(&self, ws: Uuid, user: &str) -> EngineResult<Vec<Assignment>> {
            self.inner.list_for_user(ws, user)
        }
        fn list_for_workspace(&self, ws: Uuid) -> EngineResult<Vec<Assignment>> {
            self.inner.list_for_workspace(ws)
        }
        fn users_assigned(&self, ws: Uuid, id: Uuid) -> EngineResult<BTreeSet<String>> {
            self.inner.users_assigned(ws, id)
        }
    }

    #[test]
    fn test_failed_batch_does_not_advance_period() {
        let flaky = Arc::new(FlakyAssignments {
            inner: InMemoryAssignmentStore::new(),
            failing: AtomicBool::new(true),
        });
        let stores = Stores {
            assignments: flaky.clone(),
            ..Stores::in_memory()
        };
        let f = Fixture::with_stores(stores);
        let segment = f.segment("s", SegmentBuilder::new().trait_exists("email"));
        let now = Utc::now();
        f.identify("u1", json!({"email": "a@b.c"}), now - Duration::seconds(1));

        let err = f.engine.compute_assignments(f.ws, now).unwrap_err();
        assert!(err.is_transient());
        assert!(f.engine.stores().periods.latest(f.ws, STEP).unwrap().is_none());

        // The retry covers the same window; history written by the failed
        // attempt is not duplicated.
        flaky.failing.store(false, Ordering::SeqCst);
        let report = f.engine.compute_assignments(f.ws, now).unwrap();
        assert_eq!(report.window.start, None);
        assert_eq!(report.assignments_written, 1);
        assert_eq!(report.history_inserted, 0);
        assert_eq!(f.assignment("u1", segment.id), Some(AssignmentValue::Segment(true)));
        assert_eq!(
            f.engine.stores().history.records_for(f.ws, segment.id).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_concurrent_trigger_is_coalesced() {
        let f = Fixture::new();
        let lock = f.engine.lock_for(f.ws);
        let _held = lock.lock();
        assert_eq!(
            f.engine.try_compute_assignments(f.ws, Utc::now()).unwrap(),
            RunOutcome::Coalesced
        );
        // Other workspaces are independent.
        assert!(matches!(
            f.engine.try_compute_assignments(Uuid::new_v4(), Utc::now()).unwrap(),
            RunOutcome::Completed(_)
        ));
    }
}
