//! API server: REST endpoints plus the Prometheus exporter.

use crate::computed_rest;
use crate::rest::{self, AppState};
use crate::segments_rest;
use audience_core::config::AppConfig;
use axum::routing::{get, post, put};
use axum::Router;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the full route table over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Definitions
        .route(
            "/segments",
            put(segments_rest::upsert_segment).get(segments_rest::list_segments),
        )
        .route(
            "/user-properties",
            put(segments_rest::upsert_user_property).get(segments_rest::list_user_properties),
        )
        .route("/segments/manual", put(segments_rest::upload_manual_list))
        // Assignment reads
        .route("/segments/assignments", get(segments_rest::segment_assignments))
        .route("/segments/download", get(segments_rest::download))
        .route(
            "/segments/:id/recently-updated",
            get(segments_rest::recently_updated),
        )
        // Events and recompute
        .route("/events", post(computed_rest::ingest_events))
        .route("/computed-properties/periods", get(computed_rest::periods))
        .route(
            "/computed-properties/trigger-recompute",
            post(computed_rest::trigger_recompute),
        )
        // Operational endpoints
        .route("/health", get(rest::health_check))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP front of the segment engine.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
