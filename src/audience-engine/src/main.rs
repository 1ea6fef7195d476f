//! Audience engine: computed properties and segments over an event stream.
//!
//! Main entry point that wires the stores, starts the recompute scheduler and
//! serves the HTTP API.

use audience_api::{ApiServer, AppState};
use audience_core::config::AppConfig;
use audience_segmentation::{AssignmentEngine, RunOutcome, Stores};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "audience-engine")]
#[command(about = "Computed properties and segment assignment engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Recompute interval in milliseconds (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__COMPUTE__INTERVAL_MS")]
    compute_interval_ms: Option<u64>,

    /// Serve the API without the periodic recompute
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "audience_engine=info,audience_segmentation=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Audience engine starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(interval) = cli.compute_interval_ms {
        config.compute.interval_ms = interval;
    }
    if cli.no_scheduler {
        config.compute.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        compute_interval_ms = config.compute.interval_ms,
        manual_version_policy = ?config.compute.manual_version_policy,
        "Configuration loaded"
    );

    let state = AppState::new(
        config.node_id.clone(),
        Stores::in_memory(),
        config.compute.manual_version_policy,
    );

    let api_server = ApiServer::new(config.clone(), state.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    if config.compute.enabled {
        let engine = state.engine.clone();
        let interval = Duration::from_millis(config.compute.interval_ms.max(1));
        tokio::spawn(run_scheduler(engine, interval));
        info!(interval_ms = config.compute.interval_ms, "Recompute scheduler started");
    } else {
        info!("Recompute scheduler disabled");
    }

    info!("Audience engine is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}

/// Recomputes every known workspace once per tick. A workspace whose previous
/// run is still in flight is skipped for that tick.
async fn run_scheduler(engine: Arc<AssignmentEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let engine = engine.clone();
        let results = match tokio::task::spawn_blocking(move || engine.compute_all(Utc::now())).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "Recompute task panicked");
                continue;
            }
        };
        for (workspace_id, result) in results {
            match result {
                Ok(RunOutcome::Completed(report)) => debug!(
                    workspace_id = %workspace_id,
                    users = report.users_evaluated,
                    written = report.assignments_written,
                    "Scheduled recompute finished"
                ),
                Ok(RunOutcome::Coalesced) => {
                    debug!(workspace_id = %workspace_id, "Recompute already running")
                }
                Err(e) => error!(workspace_id = %workspace_id, error = %e, "Scheduled recompute failed"),
            }
        }
    }
}
