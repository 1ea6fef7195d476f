//! Event ingest, computed-property periods and recompute triggers.

use audience_core::types::{ComputedPropertyStep, EventType, UserEvent};
use audience_segmentation::{Freshness, RunOutcome};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::rest::{ApiError, AppState};
use crate::segments_rest::WorkspaceQuery;

const MAX_BATCH: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    #[serde(default)]
    pub message_id: Option<Uuid>,
    pub user_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Defaults to the time the event is received.
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub workspace_id: Uuid,
    pub events: Vec<IngestEvent>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

#[derive(Debug, Serialize)]
pub struct PeriodView {
    pub step: ComputedPropertyStep,
    pub last_recomputed: Option<DateTime<Utc>>,
    pub freshness: Freshness,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub workspace_id: Uuid,
}

fn validate(event: &IngestEvent) -> Result<(), String> {
    if event.user_id.is_empty() {
        return Err("user_id must not be empty".into());
    }
    match (event.event_type, event.event.as_deref()) {
        (EventType::Track, None | Some("")) => Err("track events need an event name".into()),
        _ => Ok(()),
    }
}

/// POST /events: Append identify and track events.
pub async fn ingest_events(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    if request.events.len() > MAX_BATCH {
        return Err(ApiError::BadRequest(format!(
            "at most {} events per request",
            MAX_BATCH
        )));
    }
    for event in &request.events {
        validate(event).map_err(ApiError::BadRequest)?;
    }

    let received_at = Utc::now();
    let events: Vec<UserEvent> = request
        .events
        .into_iter()
        .map(|e| UserEvent {
            message_id: e.message_id.unwrap_or_else(Uuid::new_v4),
            workspace_id: request.workspace_id,
            user_id: e.user_id,
            event_type: e.event_type,
            event: e.event,
            properties: e.properties,
            event_time: e.event_time.unwrap_or(received_at),
            received_at,
        })
        .collect();
    let accepted = events.len();
    state.stores.events.append(events)?;
    metrics::counter!("api.events_ingested").increment(accepted as u64);
    debug!(workspace_id = %request.workspace_id, accepted, "Events ingested");
    Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted })))
}

/// GET /computed-properties/periods: Last recompute per step.
pub async fn periods(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<Vec<PeriodView>>, ApiError> {
    let now = Utc::now();
    let views = state
        .tracker
        .periods(query.workspace_id)?
        .into_iter()
        .map(|p| -> Result<PeriodView, ApiError> {
            let freshness = state.tracker.freshness(query.workspace_id, p.step, now)?;
            Ok(PeriodView {
                step: p.step,
                last_recomputed: p.last_recomputed,
                freshness,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(views))
}

/// POST /computed-properties/trigger-recompute: Run a recompute now, or
/// report that one is already in flight.
pub async fn trigger_recompute(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        engine.try_compute_assignments(request.workspace_id, Utc::now())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(outcome))
}
