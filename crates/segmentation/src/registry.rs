//! Definition registry: persisted segments and user properties, upsert
//! validation, and the segment status state machine.

use std::collections::BTreeSet;

use audience_core::types::ResourceKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::computed::UserPropertyDefinition;
use crate::definition::{DefinitionError, SegmentDefinition, SegmentTree};

/// Lifecycle status of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    /// Manually maintained; not continuously recomputed.
    NotStarted,
    Running,
}

/// Manual entry nodes are operator-driven; everything else is recomputed.
pub fn status_for(definition: &SegmentDefinition) -> SegmentStatus {
    if definition.entry_node.is_manual() {
        SegmentStatus::NotStarted
    } else {
        SegmentStatus::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub definition: SegmentDefinition,
    pub status: SegmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the definition tree itself changed.
    pub definition_updated_at: DateTime<Utc>,
}

impl Segment {
    pub fn tree(&self) -> Result<SegmentTree, DefinitionError> {
        SegmentTree::from_definition(&self.definition)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProperty {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub definition: UserPropertyDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub definition_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertSegment {
    pub workspace_id: Uuid,
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub definition: SegmentDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertUserProperty {
    pub workspace_id: Uuid,
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub definition: UserPropertyDefinition,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpsertValidationError {
    #[error("unique constraint violation: {0}")]
    UniqueConstraintViolation(String),
    #[error("bad values: {0}")]
    BadValues(#[from] DefinitionError),
}

/// Stored definitions. Ids are global across workspaces; names are unique per
/// `(workspace, kind)`.
pub struct DefinitionRegistry {
    segments: DashMap<Uuid, Segment>,
    user_properties: DashMap<Uuid, UserProperty>,
    names: DashMap<(Uuid, ResourceKind, String), Uuid>,
    write_lock: Mutex<()>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            segments: DashMap::new(),
            user_properties: DashMap::new(),
            names: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn upsert_segment(&self, request: UpsertSegment) -> Result<Segment, UpsertValidationError> {
        SegmentTree::from_definition(&request.definition)?;
        let name = non_empty_name(&request.name)?;

        let _guard = self.write_lock.lock();
        let now = Utc::now();
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let existing = self.segments.get(&id).map(|s| s.clone());
        if let Some(existing) = &existing {
            if existing.workspace_id != request.workspace_id {
                return Err(UpsertValidationError::UniqueConstraintViolation(format!(
                    "segment id {} belongs to another workspace",
                    id
                )));
            }
        }
        self.claim_name(request.workspace_id, ResourceKind::Segment, &name, id)?;

        let status = status_for(&request.definition);
        let segment = match existing {
            Some(previous) => {
                let definition_updated_at = if previous.definition == request.definition {
                    previous.definition_updated_at
                } else {
                    now
                };
                if previous.name != name {
                    self.names
                        .remove(&(previous.workspace_id, ResourceKind::Segment, previous.name.clone()));
                }
                Segment {
                    name,
                    definition: request.definition,
                    status,
                    updated_at: now,
                    definition_updated_at,
                    ..previous
                }
            }
            None => Segment {
                id,
                workspace_id: request.workspace_id,
                name,
                definition: request.definition,
                status,
                created_at: now,
                updated_at: now,
                definition_updated_at: now,
            },
        };

        self.names.insert(
            (segment.workspace_id, ResourceKind::Segment, segment.name.clone()),
            segment.id,
        );
        self.segments.insert(segment.id, segment.clone());
        metrics::counter!("segments.upserts").increment(1);
        info!(
            workspace_id = %segment.workspace_id,
            segment_id = %segment.id,
            name = %segment.name,
            status = ?segment.status,
            "Segment upserted"
        );
        Ok(segment)
    }

    pub fn upsert_user_property(
        &self,
        request: UpsertUserProperty,
    ) -> Result<UserProperty, UpsertValidationError> {
        request.definition.validate()?;
        let name = non_empty_name(&request.name)?;

        let _guard = self.write_lock.lock();
        let now = Utc::now();
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let existing = self.user_properties.get(&id).map(|p| p.clone());
        if let Some(existing) = &existing {
            if existing.workspace_id != request.workspace_id {
                return Err(UpsertValidationError::UniqueConstraintViolation(format!(
                    "user property id {} belongs to another workspace",
                    id
                )));
            }
        }
        self.claim_name(request.workspace_id, ResourceKind::UserProperty, &name, id)?;

        let property = match existing {
            Some(previous) => {
                let definition_updated_at = if previous.definition == request.definition {
                    previous.definition_updated_at
                } else {
                    now
                };
                if previous.name != name {
                    self.names.remove(&(
                        previous.workspace_id,
                        ResourceKind::UserProperty,
                        previous.name.clone(),
                    ));
                }
                UserProperty {
                    name,
                    definition: request.definition,
                    updated_at: now,
                    definition_updated_at,
                    ..previous
                }
            }
            None => UserProperty {
                id,
                workspace_id: request.workspace_id,
                name,
                definition: request.definition,
                created_at: now,
                updated_at: now,
                definition_updated_at: now,
            },
        };

        self.names.insert(
            (property.workspace_id, ResourceKind::UserProperty, property.name.clone()),
            property.id,
        );
        self.user_properties.insert(property.id, property.clone());
        info!(
            workspace_id = %property.workspace_id,
            user_property_id = %property.id,
            name = %property.name,
            "User property upserted"
        );
        Ok(property)
    }

    /// Fails when `name` is held by a different id in the same workspace and kind.
    fn claim_name(
        &self,
        workspace_id: Uuid,
        kind: ResourceKind,
        name: &str,
        id: Uuid,
    ) -> Result<(), UpsertValidationError> {
        match self.names.get(&(workspace_id, kind, name.to_string())) {
            Some(holder) if *holder != id => Err(UpsertValidationError::UniqueConstraintViolation(
                format!("{} name {:?} is already in use", kind.as_str(), name),
            )),
            _ => Ok(()),
        }
    }

    pub fn get_segment(&self, workspace_id: Uuid, id: Uuid) -> Option<Segment> {
        self.segments
            .get(&id)
            .filter(|s| s.workspace_id == workspace_id)
            .map(|s| s.clone())
    }

    pub fn list_segments(&self, workspace_id: Uuid) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| s.workspace_id == workspace_id)
            .map(|s| s.value().clone())
            .collect();
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        segments
    }

    pub fn get_user_property(&self, workspace_id: Uuid, id: Uuid) -> Option<UserProperty> {
        self.user_properties
            .get(&id)
            .filter(|p| p.workspace_id == workspace_id)
            .map(|p| p.clone())
    }

    pub fn list_user_properties(&self, workspace_id: Uuid) -> Vec<UserProperty> {
        let mut properties: Vec<UserProperty> = self
            .user_properties
            .iter()
            .filter(|p| p.workspace_id == workspace_id)
            .map(|p| p.value().clone())
            .collect();
        properties.sort_by(|a, b| a.name.cmp(&b.name));
        properties
    }

    /// Workspaces owning at least one definition.
    pub fn workspaces(&self) -> BTreeSet<Uuid> {
        self.segments
            .iter()
            .map(|s| s.workspace_id)
            .chain(self.user_properties.iter().map(|p| p.workspace_id))
            .collect()
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty_name(name: &str) -> Result<String, UpsertValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DefinitionError::EmptyField("name").into());
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SegmentBuilder;
    use serde_json::json;

    fn trait_segment() -> SegmentDefinition {
        SegmentBuilder::new()
            .trait_equals("name", json!("test"))
            .build()
            .unwrap()
    }

    fn upsert(ws: Uuid, id: Option<Uuid>, name: &str, definition: SegmentDefinition) -> UpsertSegment {
        UpsertSegment {
            workspace_id: ws,
            id,
            name: name.to_string(),
            definition,
        }
    }

    #[test]
    fn test_status_transitions() {
        let registry = DefinitionRegistry::new();
        let ws = Uuid::new_v4();

        let created = registry
            .upsert_segment(upsert(ws, None, "s", trait_segment()))
            .unwrap();
        assert_eq!(created.status, SegmentStatus::Running);

        let manual = registry
            .upsert_segment(upsert(ws, Some(created.id), "s", SegmentBuilder::manual(1)))
            .unwrap();
        assert_eq!(manual.status, SegmentStatus::NotStarted);
        assert_eq!(manual.created_at, created.created_at);

        let back = registry
            .upsert_segment(upsert(ws, Some(created.id), "s", trait_segment()))
            .unwrap();
        assert_eq!(back.status, SegmentStatus::Running);

        let fresh_manual = registry
            .upsert_segment(upsert(ws, None, "m", SegmentBuilder::manual(1)))
            .unwrap();
        assert_eq!(fresh_manual.status, SegmentStatus::NotStarted);
    }

    #[test]
    fn test_name_uniqueness_is_per_workspace_and_kind() {
        let registry = DefinitionRegistry::new();
        let ws = Uuid::new_v4();

        registry
            .upsert_segment(upsert(ws, None, "vip", trait_segment()))
            .unwrap();
        let err = registry
            .upsert_segment(upsert(ws, None, "vip", trait_segment()))
            .unwrap_err();
        assert!(matches!(err, UpsertValidationError::UniqueConstraintViolation(_)));

        // Other workspace and other kind are free to reuse the name.
        registry
            .upsert_segment(upsert(Uuid::new_v4(), None, "vip", trait_segment()))
            .unwrap();
        registry
            .upsert_user_property(UpsertUserProperty {
                workspace_id: ws,
                id: None,
                name: "vip".into(),
                definition: UserPropertyDefinition::Id,
            })
            .unwrap();
    }

    #[test]
    fn test_id_reuse_across_workspaces_rejected() {
        let registry = DefinitionRegistry::new();
        let id = Uuid::new_v4();
        registry
            .upsert_segment(upsert(Uuid::new_v4(), Some(id), "a", trait_segment()))
            .unwrap();
        let err = registry
            .upsert_segment(upsert(Uuid::new_v4(), Some(id), "a", trait_segment()))
            .unwrap_err();
        assert!(matches!(err, UpsertValidationError::UniqueConstraintViolation(_)));
    }

    #[test]
    fn test_rename_in_place_frees_old_name() {
        let registry = DefinitionRegistry::new();
        let ws = Uuid::new_v4();
        let segment = registry
            .upsert_segment(upsert(ws, None, "before", trait_segment()))
            .unwrap();

        let renamed = registry
            .upsert_segment(upsert(ws, Some(segment.id), "after", segment.definition.clone()))
            .unwrap();
        assert_eq!(renamed.id, segment.id);
        assert_eq!(renamed.name, "after");
        assert_eq!(renamed.definition_updated_at, segment.definition_updated_at);

        registry
            .upsert_segment(upsert(ws, None, "before", trait_segment()))
            .unwrap();
        let names: Vec<String> = registry.list_segments(ws).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["after".to_string(), "before".to_string()]);
    }

    #[test]
    fn test_invalid_definition_is_bad_values() {
        let registry = DefinitionRegistry::new();
        let raw: SegmentDefinition = serde_json::from_value(json!({
            "entry_node": { "type": "not", "id": "root", "child": "missing" }
        }))
        .unwrap();
        let err = registry
            .upsert_segment(upsert(Uuid::new_v4(), None, "broken", raw))
            .unwrap_err();
        assert!(matches!(
            err,
            UpsertValidationError::BadValues(DefinitionError::DanglingReference { .. })
        ));
        assert!(registry.workspaces().is_empty());
    }

    #[test]
    fn test_lookups_are_workspace_scoped() {
        let registry = DefinitionRegistry::new();
        let ws = Uuid::new_v4();
        let segment = registry
            .upsert_segment(upsert(ws, None, "s", trait_segment()))
            .unwrap();
        assert!(registry.get_segment(ws, segment.id).is_some());
        assert!(registry.get_segment(Uuid::new_v4(), segment.id).is_none());
        assert!(registry.list_segments(Uuid::new_v4()).is_empty());
    }
}
