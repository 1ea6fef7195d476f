use std::collections::BTreeSet;

use audience_core::error::{EngineError, EngineResult};
use audience_core::types::{ComputedPropertyStep, UserEvent, UserSnapshot};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    Assignment, AssignmentStore, ComputedPropertyPeriod, EventStore, HistoryRecord, HistoryStore,
    ManualMembershipStore, PeriodStore,
};
use crate::evaluator::ManualMembership;

struct Appended {
    sequence: u64,
    event: UserEvent,
}

/// Events grouped by `(workspace, user)`, each tagged with its append
/// sequence.
pub struct InMemoryEventStore {
    events: DashMap<(Uuid, String), Vec<Appended>>,
    sequences: DashMap<Uuid, u64>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            sequences: DashMap::new(),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, events: Vec<UserEvent>) -> EngineResult<()> {
        for event in events {
            // The counter guard is held until the event is stored, so a reader
            // of `high_watermark` never sees a sequence whose event is missing.
            let mut counter = self.sequences.entry(event.workspace_id).or_insert(0);
            *counter += 1;
            let sequence = *counter;
            self.events
                .entry((event.workspace_id, event.user_id.clone()))
                .or_default()
                .push(Appended { sequence, event });
            drop(counter);
        }
        Ok(())
    }

    fn high_watermark(&self, workspace_id: Uuid) -> EngineResult<u64> {
        Ok(self.sequences.get(&workspace_id).map_or(0, |s| *s))
    }

    fn users_appended(
        &self,
        workspace_id: Uuid,
        after: u64,
        until: u64,
    ) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .events
            .iter()
            .filter(|entry| entry.key().0 == workspace_id)
            .filter(|entry| {
                entry
                    .value()
                    .iter()
                    .any(|a| a.sequence > after && a.sequence <= until)
            })
            .map(|entry| entry.key().1.clone())
            .collect())
    }

    fn users_with_activity(
        &self,
        workspace_id: Uuid,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .events
            .iter()
            .filter(|entry| entry.key().0 == workspace_id)
            .filter(|entry| {
                entry.value().iter().any(|a| {
                    a.event.received_at <= until
                        && after.map_or(true, |after| a.event.received_at > after)
                })
            })
            .map(|entry| entry.key().1.clone())
            .collect())
    }

    fn all_users(&self, workspace_id: Uuid, until: DateTime<Utc>) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .events
            .iter()
            .filter(|entry| entry.key().0 == workspace_id)
            .filter(|entry| entry.value().iter().any(|a| a.event.received_at <= until))
            .map(|entry| entry.key().1.clone())
            .collect())
    }

    fn snapshot(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> EngineResult<UserSnapshot> {
        let snapshot = match self.events.get(&(workspace_id, user_id.to_string())) {
            Some(events) => {
                UserSnapshot::from_events(user_id, events.iter().map(|a| &a.event), as_of)
            }
            None => UserSnapshot::empty(user_id, as_of),
        };
        Ok(snapshot)
    }

    fn delete_workspace(&self, workspace_id: Uuid) -> EngineResult<usize> {
        let mut removed = 0;
        self.events.retain(|(ws, _), events| {
            if *ws == workspace_id {
                removed += events.len();
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

pub struct InMemoryAssignmentStore {
    assignments: DashMap<(Uuid, String, Uuid), Assignment>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self {
            assignments: DashMap::new(),
        }
    }
}

impl Default for InMemoryAssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentStore for InMemoryAssignmentStore {
    fn get(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        computed_property_id: Uuid,
    ) -> EngineResult<Option<Assignment>> {
        Ok(self
            .assignments
            .get(&(workspace_id, user_id.to_string(), computed_property_id))
            .map(|a| a.clone()))
    }

    fn upsert_batch(&self, assignments: &[Assignment]) -> EngineResult<()> {
        for a in assignments {
            self.assignments.insert(
                (a.workspace_id, a.user_id.clone(), a.computed_property_id),
                a.clone(),
            );
        }
        Ok(())
    }

    fn list_for_user(&self, workspace_id: Uuid, user_id: &str) -> EngineResult<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|entry| entry.key().0 == workspace_id && entry.key().1 == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn list_for_workspace(&self, workspace_id: Uuid) -> EngineResult<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|entry| entry.key().0 == workspace_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn users_assigned(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .assignments
            .iter()
            .filter(|entry| entry.key().0 == workspace_id && entry.key().2 == computed_property_id)
            .map(|entry| entry.key().1.clone())
            .collect())
    }
}

/// History rows grouped by `(workspace, computed property)`.
pub struct InMemoryHistoryStore {
    records: DashMap<(Uuid, Uuid), Vec<HistoryRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn insert_batch(&self, records: &[HistoryRecord]) -> EngineResult<usize> {
        let mut inserted = 0;
        for record in records {
            // The entry guard holds the shard lock, so check-then-push is atomic.
            let mut rows = self
                .records
                .entry((record.workspace_id, record.computed_property_id))
                .or_default();
            let duplicate = rows
                .iter()
                .rev()
                .find(|r| r.user_id == record.user_id)
                .is_some_and(|latest| {
                    latest.max_event_time == record.max_event_time && latest.value == record.value
                });
            if !duplicate {
                rows.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn records_for(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngineResult<Vec<HistoryRecord>> {
        Ok(self
            .records
            .get(&(workspace_id, computed_property_id))
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}

pub struct InMemoryPeriodStore {
    latest: DashMap<(Uuid, ComputedPropertyStep), ComputedPropertyPeriod>,
}

impl InMemoryPeriodStore {
    pub fn new() -> Self {
        Self {
            latest: DashMap::new(),
        }
    }
}

impl Default for InMemoryPeriodStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodStore for InMemoryPeriodStore {
    fn latest(
        &self,
        workspace_id: Uuid,
        step: ComputedPropertyStep,
    ) -> EngineResult<Option<ComputedPropertyPeriod>> {
        Ok(self.latest.get(&(workspace_id, step)).map(|p| p.clone()))
    }

    fn record(&self, period: ComputedPropertyPeriod) -> EngineResult<()> {
        match self.latest.entry((period.workspace_id, period.step)) {
            Entry::Occupied(mut existing) => {
                let previous = existing.get().period_end;
                if period.period_end < previous {
                    return Err(EngineError::PeriodRegression {
                        step: period.step,
                        previous,
                        attempted: period.period_end,
                    });
                }
                existing.insert(period);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(period);
            }
        }
        Ok(())
    }
}

pub struct InMemoryManualMembershipStore {
    lists: DashMap<(Uuid, Uuid), ManualMembership>,
}

impl InMemoryManualMembershipStore {
    pub fn new() -> Self {
        Self {
            lists: DashMap::new(),
        }
    }
}

impl Default for InMemoryManualMembershipStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualMembershipStore for InMemoryManualMembershipStore {
    fn replace(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        version: i64,
        user_ids: BTreeSet<String>,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.lists.insert(
            (workspace_id, segment_id),
            ManualMembership {
                version,
                user_ids,
                updated_at: at,
            },
        );
        Ok(())
    }

    fn get(&self, workspace_id: Uuid, segment_id: Uuid) -> EngineResult<Option<ManualMembership>> {
        Ok(self.lists.get(&(workspace_id, segment_id)).map(|m| m.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AssignmentValue;
    use chrono::Duration;
    use serde_json::json;

    fn history(ws: Uuid, cp: Uuid, user: &str, value: bool, max_event_time: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord {
            workspace_id: ws,
            user_id: user.to_string(),
            computed_property_id: cp,
            value: AssignmentValue::Segment(value),
            max_event_time: Some(max_event_time),
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn test_activity_scan_is_bounded_on_received_at() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        let now = Utc::now();
        let mut late = UserEvent::track(ws, "late", "open", json!({}), now - Duration::days(3));
        late.received_at = now;
        store
            .append(vec![
                UserEvent::identify(ws, "old", json!({}), now - Duration::hours(2)),
                late,
                UserEvent::identify(Uuid::new_v4(), "other-ws", json!({}), now),
            ])
            .unwrap();

        let active = store
            .users_with_activity(ws, Some(now - Duration::hours(1)), now)
            .unwrap();
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec!["late".to_string()]);
        assert_eq!(store.all_users(ws, now).unwrap().len(), 2);
    }

    #[test]
    fn test_appended_users_by_sequence() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        let now = Utc::now();
        assert_eq!(store.high_watermark(ws).unwrap(), 0);

        store
            .append(vec![UserEvent::identify(ws, "first", json!({}), now)])
            .unwrap();
        let mark = store.high_watermark(ws).unwrap();
        // Stamped long ago, appended later: invisible to a receipt-time scan
        // of the later range but found by sequence.
        store
            .append(vec![
                UserEvent::identify(ws, "late", json!({}), now - Duration::hours(1)),
                UserEvent::identify(Uuid::new_v4(), "other-ws", json!({}), now),
            ])
            .unwrap();

        assert_eq!(mark, 1);
        assert_eq!(store.high_watermark(ws).unwrap(), 2);
        let appended = store
            .users_appended(ws, mark, store.high_watermark(ws).unwrap())
            .unwrap();
        assert_eq!(appended.into_iter().collect::<Vec<_>>(), vec!["late".to_string()]);
        assert!(store.users_with_activity(ws, Some(now), now).unwrap().is_empty());
    }

    #[test]
    fn test_delete_workspace() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        let keep = Uuid::new_v4();
        let now = Utc::now();
        store
            .append(vec![
                UserEvent::identify(ws, "a", json!({}), now),
                UserEvent::track(ws, "a", "open", json!({}), now),
                UserEvent::identify(keep, "a", json!({}), now),
            ])
            .unwrap();

        assert_eq!(store.delete_workspace(ws).unwrap(), 2);
        assert!(store.all_users(ws, now).unwrap().is_empty());
        assert_eq!(store.all_users(keep, now).unwrap().len(), 1);
    }

    #[test]
    fn test_history_dedup_against_latest_record() {
        let store = InMemoryHistoryStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());
        let t = Utc::now();

        assert_eq!(store.insert_batch(&[history(ws, cp, "u1", true, t)]).unwrap(), 1);
        assert_eq!(store.insert_batch(&[history(ws, cp, "u1", true, t)]).unwrap(), 0);
        assert_eq!(store.insert_batch(&[history(ws, cp, "u1", false, t)]).unwrap(), 1);
        // Flipping back is a new logical write, not a duplicate.
        assert_eq!(store.insert_batch(&[history(ws, cp, "u1", true, t)]).unwrap(), 1);
        assert_eq!(store.records_for(ws, cp).unwrap().len(), 3);
        assert!(store.records_for(Uuid::new_v4(), cp).unwrap().is_empty());
    }

    #[test]
    fn test_period_regression_rejected() {
        let store = InMemoryPeriodStore::new();
        let ws = Uuid::new_v4();
        let now = Utc::now();
        let period = |end| ComputedPropertyPeriod {
            workspace_id: ws,
            step: ComputedPropertyStep::ComputeAssignments,
            period_start: None,
            period_end: end,
            created_at: Utc::now(),
            sequence: 0,
        };

        store.record(period(now)).unwrap();
        store.record(period(now)).unwrap();
        let err = store.record(period(now - Duration::seconds(1))).unwrap_err();
        assert!(matches!(err, EngineError::PeriodRegression { .. }));
        let latest = store
            .latest(ws, ComputedPropertyStep::ComputeAssignments)
            .unwrap()
            .unwrap();
        assert_eq!(latest.period_end, now);
    }
}
