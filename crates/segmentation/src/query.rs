//! Read paths over current assignments and assignment history.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use audience_core::error::EngineResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::DefinitionRegistry;
use crate::store::{HistoryRecord, Stores};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentlyUpdatedUser {
    pub user_id: String,
    pub assigned_at: DateTime<Utc>,
}

pub struct AssignmentQueries {
    registry: Arc<DefinitionRegistry>,
    stores: Stores,
}

impl AssignmentQueries {
    pub fn new(registry: Arc<DefinitionRegistry>, stores: Stores) -> Self {
        Self { registry, stores }
    }

    pub(crate) fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub(crate) fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Segment name to membership for one individual. Segments not yet
    /// evaluated for them are omitted.
    pub fn find_all_segment_assignments(
        &self,
        workspace_id: Uuid,
        user_id: &str,
    ) -> EngineResult<BTreeMap<String, bool>> {
        let mut memberships = BTreeMap::new();
        for assignment in self.stores.assignments.list_for_user(workspace_id, user_id)? {
            let Some(in_segment) = assignment.value.in_segment() else {
                continue;
            };
            if let Some(segment) = self
                .registry
                .get_segment(workspace_id, assignment.computed_property_id)
            {
                memberships.insert(segment.name, in_segment);
            }
        }
        Ok(memberships)
    }

    /// Individuals whose latest history record puts them in the segment with
    /// `assigned_at` strictly after `assigned_since`, oldest first. Callers
    /// page by passing the last returned `assigned_at` back in; the engine
    /// never gives two rows of a workspace the same `assigned_at`.
    pub fn find_recently_updated_users_in_segment(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        assigned_since: DateTime<Utc>,
        page_size: usize,
    ) -> EngineResult<Vec<RecentlyUpdatedUser>> {
        let records = self.stores.history.records_for(workspace_id, segment_id)?;

        let mut latest: HashMap<&str, &HistoryRecord> = HashMap::new();
        for record in &records {
            latest
                .entry(record.user_id.as_str())
                .and_modify(|current| {
                    if record.assigned_at >= current.assigned_at {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut users: Vec<RecentlyUpdatedUser> = latest
            .into_values()
            .filter(|r| r.value.in_segment() == Some(true) && r.assigned_at > assigned_since)
            .map(|r| RecentlyUpdatedUser {
                user_id: r.user_id.clone(),
                assigned_at: r.assigned_at,
            })
            .collect();
        users.sort_by(|a, b| {
            a.assigned_at
                .cmp(&b.assigned_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users.truncate(page_size);
        Ok(users)
    }
}
