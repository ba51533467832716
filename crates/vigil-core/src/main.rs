use anyhow::{Context, Result};
use diesel::Connection as _;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::config::Config;
use vigil_core::pg_store::PgStore;
use vigil_core::playbook::{FilePlaybookStore, PlaybookStore};
use vigil_core::scheduler::{spawn_completion_loop, spawn_scheduler};
use vigil_core::{
    MonitoringRunner, OpenAiCompatClient, PlaybookExecutor, Scheduler, ScheduleStatus,
};
use vigil_tools::PgQueryExecutor;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint - returns 200 OK when the service is running
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    max_parallel_runs: usize,
    schedules: BTreeMap<&'static str, usize>,
}

/// Schedule counts by status
async fn scheduler_status(
    State(scheduler): State<Arc<Scheduler>>,
) -> Result<Json<StatusResponse>, (axum::http::StatusCode, String)> {
    let schedules = scheduler.list_schedules().map_err(|e| {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            format!("Failed to list schedules: {}", e),
        )
    })?;

    let mut counts = BTreeMap::new();
    for status in [
        ScheduleStatus::Scheduled,
        ScheduleStatus::Running,
        ScheduleStatus::Disabled,
        ScheduleStatus::Failed,
    ] {
        counts.insert(status.as_str(), 0);
    }
    for schedule in &schedules {
        *counts.entry(schedule.status.as_str()).or_insert(0) += 1;
    }

    Ok(Json(StatusResponse {
        max_parallel_runs: scheduler.config().max_parallel_runs,
        schedules: counts,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vigil=debug,vigil_core=debug,vigil_tools=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🔭 Vigil starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!("Configuration loaded");
    info!("  Max parallel runs: {}", config.scheduler.max_parallel_runs);
    info!("  Run timeout: {}s", config.scheduler.timeout_seconds);
    info!("  Playbooks: {}", config.playbooks_dir);
    info!("  Display timezone: {}", config.scheduler.display_timezone);

    // Run database migrations first
    {
        use diesel::prelude::*;
        use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
        pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

        let mut conn = diesel::PgConnection::establish(&config.database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
        info!("Database migrations applied");
    }

    let conn = diesel::PgConnection::establish(&config.database_url)
        .context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(Arc::new(Mutex::new(conn))));
    info!("Schedule store connected");

    let playbooks: Arc<dyn PlaybookStore> = Arc::new(FilePlaybookStore::new(&config.playbooks_dir));
    match playbooks.list_names().await {
        Ok(names) => info!("{} playbook(s) available: {}", names.len(), names.join(", ")),
        Err(e) => error!("Failed to list playbooks: {}", e),
    }

    let model = Arc::new(OpenAiCompatClient::new(config.models.clone())?);
    let executor = PlaybookExecutor::new(playbooks.clone(), model, config.max_execution_turns);
    let runner = Arc::new(MonitoringRunner::new(
        store.clone(),
        Arc::new(PgQueryExecutor::new()),
        playbooks,
        executor,
        config.scheduler.display_timezone,
    ));

    let (scheduler, completions) = Scheduler::new(store, runner, config.scheduler.clone());
    let scheduler = Arc::new(scheduler);

    let completion_loop = spawn_completion_loop(scheduler.clone(), completions);
    let tick_loop = spawn_scheduler(scheduler.clone(), config.scheduler.poll_interval_secs);
    info!(
        "Scheduler started (polling every {}s)",
        config.scheduler.poll_interval_secs
    );

    // Start HTTP health check server
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(scheduler_status))
        .layer(TraceLayer::new_for_http())
        .with_state(scheduler);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Health check server error: {}", e);
        }
    });
    info!("Health check server listening on port {}", config.http_port);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    tick_loop.abort();
    completion_loop.abort();

    Ok(())
}
