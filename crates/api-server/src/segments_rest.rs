//! Segment and user-property REST endpoints: upserts, manual lists,
//! assignment lookups and the bulk download.

use std::collections::{BTreeMap, BTreeSet};

use audience_segmentation::{
    RecentlyUpdatedUser, Segment, UpsertSegment, UpsertUserProperty, UserProperty,
};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::rest::{ApiError, AppState};

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UserAssignmentsQuery {
    pub workspace_id: Uuid,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentlyUpdatedQuery {
    pub workspace_id: Uuid,
    pub assigned_since: DateTime<Utc>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ManualListRequest {
    pub workspace_id: Uuid,
    pub segment_id: Uuid,
    pub version: i64,
    pub user_ids: BTreeSet<String>,
}

/// PUT /segments: Create or update a segment.
pub async fn upsert_segment(
    State(state): State<AppState>,
    Json(request): Json<UpsertSegment>,
) -> Result<Json<Segment>, ApiError> {
    Ok(Json(state.registry.upsert_segment(request)?))
}

/// GET /segments: Segments of a workspace, by name.
pub async fn list_segments(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Json<Vec<Segment>> {
    Json(state.registry.list_segments(query.workspace_id))
}

/// PUT /user-properties: Create or update a user property.
pub async fn upsert_user_property(
    State(state): State<AppState>,
    Json(request): Json<UpsertUserProperty>,
) -> Result<Json<UserProperty>, ApiError> {
    Ok(Json(state.registry.upsert_user_property(request)?))
}

/// GET /user-properties: User properties of a workspace, by name.
pub async fn list_user_properties(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Json<Vec<UserProperty>> {
    Json(state.registry.list_user_properties(query.workspace_id))
}

/// GET /segments/assignments: Segment memberships of one user by name.
pub async fn segment_assignments(
    State(state): State<AppState>,
    Query(query): Query<UserAssignmentsQuery>,
) -> Result<Json<BTreeMap<String, bool>>, ApiError> {
    let assignments = state
        .queries
        .find_all_segment_assignments(query.workspace_id, &query.user_id)?;
    Ok(Json(assignments))
}

/// GET /segments/:id/recently-updated: Users who entered the segment after
/// `assigned_since`, oldest first.
pub async fn recently_updated(
    State(state): State<AppState>,
    Path(segment_id): Path<Uuid>,
    Query(query): Query<RecentlyUpdatedQuery>,
) -> Result<Json<Vec<RecentlyUpdatedUser>>, ApiError> {
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(ApiError::BadRequest(format!(
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let users = state.queries.find_recently_updated_users_in_segment(
        query.workspace_id,
        segment_id,
        query.assigned_since,
        page_size,
    )?;
    Ok(Json(users))
}

/// GET /segments/download: CSV export of all assignments in a workspace.
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let file = state.queries.build_segments_file(query.workspace_id)?;
    metrics::counter!("segments.downloads").increment(1);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.file_name),
            ),
        ],
        file.file_content,
    ))
}

/// PUT /segments/manual: Replace the membership list of a manual segment.
pub async fn upload_manual_list(
    State(state): State<AppState>,
    Json(request): Json<ManualListRequest>,
) -> Result<StatusCode, ApiError> {
    let segment = state
        .registry
        .get_segment(request.workspace_id, request.segment_id)
        .ok_or_else(|| ApiError::NotFound(format!("segment {} not found", request.segment_id)))?;
    if segment.definition.manual_version().is_none() {
        return Err(ApiError::BadRequest(format!(
            "segment {} is not manually maintained",
            segment.id
        )));
    }
    let members = request.user_ids.len();
    state.stores.manual.replace(
        request.workspace_id,
        request.segment_id,
        request.version,
        request.user_ids,
        Utc::now(),
    )?;
    info!(
        workspace_id = %request.workspace_id,
        segment_id = %request.segment_id,
        version = request.version,
        members,
        "Manual segment list replaced"
    );
    Ok(StatusCode::NO_CONTENT)
}
