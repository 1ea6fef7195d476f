//! Shared REST state, error mapping and operational endpoints.

use std::sync::Arc;
use std::time::Instant;

use audience_core::config::ManualVersionPolicy;
use audience_core::error::EngineError;
use audience_segmentation::{
    AssignmentEngine, AssignmentQueries, DefinitionRegistry, StalenessTracker, Stores,
    UpsertValidationError,
};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DefinitionRegistry>,
    pub stores: Stores,
    pub engine: Arc<AssignmentEngine>,
    pub queries: Arc<AssignmentQueries>,
    pub tracker: Arc<StalenessTracker>,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    /// Wires every component over one set of stores.
    pub fn new(
        node_id: impl Into<String>,
        stores: Stores,
        policy: ManualVersionPolicy,
    ) -> Self {
        let registry = Arc::new(DefinitionRegistry::new());
        Self {
            engine: Arc::new(AssignmentEngine::new(registry.clone(), stores.clone(), policy)),
            queries: Arc::new(AssignmentQueries::new(registry.clone(), stores.clone())),
            tracker: Arc::new(StalenessTracker::new(stores.periods.clone())),
            registry,
            stores,
            node_id: node_id.into(),
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.as_str()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "unique_constraint_violation", m.as_str()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.as_str()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", m.as_str()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error, message) = self.parts();
        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message: message.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<UpsertValidationError> for ApiError {
    fn from(e: UpsertValidationError) -> Self {
        warn!(error = %e, "Upsert rejected");
        metrics::counter!("api.validation_errors").increment(1);
        match e {
            UpsertValidationError::UniqueConstraintViolation(_) => ApiError::Conflict(e.to_string()),
            UpsertValidationError::BadValues(_) => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        error!(error = %e, "Store operation failed");
        metrics::counter!("api.errors").increment(1);
        ApiError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
