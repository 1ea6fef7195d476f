//! Bulk CSV export of per-user assignments.

use std::collections::BTreeMap;

use audience_core::error::EngineResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::query::AssignmentQueries;
use crate::store::AssignmentValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentsFile {
    pub file_name: String,
    pub file_content: String,
}

impl AssignmentQueries {
    /// One row per individual holding any assignment, ordered by user id.
    /// Columns are `user_id`, user property names, then `segment:<name>`,
    /// each group sorted by name. Identical state yields identical bytes.
    pub fn build_segments_file(&self, workspace_id: Uuid) -> EngineResult<SegmentsFile> {
        let properties = self.registry().list_user_properties(workspace_id);
        let segments = self.registry().list_segments(workspace_id);

        let columns: Vec<(Uuid, String)> = properties
            .iter()
            .map(|p| (p.id, p.name.clone()))
            .chain(segments.iter().map(|s| (s.id, format!("segment:{}", s.name))))
            .collect();

        let mut rows: BTreeMap<String, BTreeMap<Uuid, String>> = BTreeMap::new();
        for assignment in self.stores().assignments.list_for_workspace(workspace_id)? {
            rows.entry(assignment.user_id)
                .or_default()
                .insert(assignment.computed_property_id, cell(&assignment.value));
        }

        let mut content = String::new();
        push_row(
            &mut content,
            std::iter::once("user_id").chain(columns.iter().map(|(_, name)| name.as_str())),
        );
        for (user_id, cells) in &rows {
            push_row(
                &mut content,
                std::iter::once(user_id.as_str()).chain(
                    columns
                        .iter()
                        .map(|(id, _)| cells.get(id).map(String::as_str).unwrap_or("")),
                ),
            );
        }

        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        Ok(SegmentsFile {
            file_name: format!("segment-assignments-{}.csv", &digest[..16]),
            file_content: content,
        })
    }
}

fn cell(value: &AssignmentValue) -> String {
    match value {
        AssignmentValue::Segment(in_segment) => in_segment.to_string(),
        AssignmentValue::UserProperty(serde_json::Value::Null) => String::new(),
        AssignmentValue::UserProperty(serde_json::Value::String(s)) => s.clone(),
        AssignmentValue::UserProperty(other) => other.to_string(),
    }
}

fn push_row<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_field(out, field);
    }
    out.push_str("\r\n");
}

/// RFC 4180 quoting.
fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\r', '\n']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}
