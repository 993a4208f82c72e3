use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use hostplane_common::bus::{CommandType, JobCommand, CHANNEL_ORCHESTRATOR_COMMANDS};
use hostplane_orchestrator::dispatch::{JobDispatcher, LocalDispatcher};
use hostplane_orchestrator::host_manager::HostManager;
use hostplane_orchestrator::store::{PgStore, VmStore};
use hostplane_orchestrator::{
    assemble, backup_job, recovery_job, watch_dog_job, DispatchMode, Orchestrator,
    OrchestratorConfig,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let redis_client = match std::env::var("REDIS_URL") {
        Ok(url) if !url.trim().is_empty() => {
            Some(redis::Client::open(url.trim()).context("invalid REDIS_URL")?)
        }
        _ => None,
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("Failed to connect to Postgres")?;
    info!("✅ Connected to Database");

    sqlx::migrate!("../sqlx-migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let host = HostManager::get_host(&config).with_context(|| {
        format!(
            "HOSTPLANE_HOST={} is not available in this build (compiled: {:?})",
            config.host_kind,
            HostManager::available()
        )
    })?;
    info!(host = %config.host_kind, "hypervisor host selected");

    let job_dispatch = config.job_dispatch;
    let store: Arc<dyn VmStore> = Arc::new(PgStore::new(pool));
    let runtime = assemble(store.clone(), host, config, redis_client.clone())?;
    let orchestrator = runtime.orchestrator.clone();

    match orchestrator.reconcile_all().await {
        Ok(n) => info!("startup reconcile: {} VM(s) marked stopped", n),
        Err(e) => warn!("startup reconcile failed: {}", e),
    }

    // job-watch-dog (RUNNING)
    let orch_watchdog = orchestrator.clone();
    tokio::spawn(async move {
        watch_dog_job::run(orch_watchdog, watch_dog_job::WATCH_DOG_INTERVAL).await;
    });

    // Backup/restore jobs run here only in redis mode; in local mode the API
    // process executes (and recovers) its own jobs.
    if job_dispatch == DispatchMode::Redis {
        let client = redis_client
            .clone()
            .context("HOSTPLANE_JOB_DISPATCH=redis requires REDIS_URL")?;

        // Jobs claimed by a previous process can't be resumed.
        recovery_job::recover_interrupted_jobs(store.as_ref()).await?;

        // job-backup-requeue (jobs whose command was never picked up)
        let store_requeue = store.clone();
        let local_requeue: Arc<dyn JobDispatcher> = runtime.local.clone();
        tokio::spawn(async move {
            backup_job::run(store_requeue, local_requeue).await;
        });

        let local = runtime.local.clone();
        tokio::spawn(async move {
            if let Err(e) = listen_for_commands(client, local).await {
                error!("❌ command listener stopped: {:#}", e);
            }
        });
    } else {
        info!("job dispatch is local: backup/restore jobs run in the API process");
    }

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/admin/reconcile", post(reconcile))
        .with_state(orchestrator);

    let addr: SocketAddr = std::env::var("HOSTPLANE_ORCHESTRATOR_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8001".to_string())
        .parse()
        .context("invalid HOSTPLANE_ORCHESTRATOR_ADDR")?;
    info!("Orchestrator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Executes CMD:BACKUP / CMD:RESTORE published by API processes in redis dispatch mode.
async fn listen_for_commands(
    client: redis::Client,
    local: Arc<LocalDispatcher>,
) -> anyhow::Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_ORCHESTRATOR_COMMANDS).await?;
    info!(
        "🎧 Orchestrator listening on Redis channel '{}'...",
        CHANNEL_ORCHESTRATOR_COMMANDS
    );

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("unreadable command payload: {}", e);
                continue;
            }
        };

        let cmd = match serde_json::from_str::<JobCommand>(&payload) {
            Ok(cmd) => cmd,
            Err(_) => {
                warn!("⚠️  Unknown event: {}", payload);
                continue;
            }
        };
        info!(job_id = %cmd.job_id, "📩 Received {}", cmd.command_type.as_str());
        match cmd.command_type {
            CommandType::Backup | CommandType::Restore => {
                if let Err(e) = local.dispatch(cmd).await {
                    error!("dispatch failed: {:#}", e);
                }
            }
        }
    }
    Ok(())
}

async fn root() -> &'static str {
    "Hostplane Orchestrator Online"
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn reconcile(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    match orchestrator.reconcile_all().await {
        Ok(corrected) => (StatusCode::OK, Json(json!({ "reconciled": corrected }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.code(), "message": e.to_string() })),
        ),
    }
}
