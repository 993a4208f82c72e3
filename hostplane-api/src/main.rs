use anyhow::Context;
use hostplane_api::app::{create_cors, AppState};
use hostplane_api::config::{api_addr, database::create_pool, redis::create_client};
use hostplane_api::routes::create_router;
use hostplane_api::setup::run_migrations;
use hostplane_orchestrator::dispatch::JobDispatcher;
use hostplane_orchestrator::host_manager::HostManager;
use hostplane_orchestrator::store::{PgStore, VmStore};
use hostplane_orchestrator::{assemble, backup_job, recovery_job, DispatchMode, OrchestratorConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let redis_client = create_client(std::env::var("REDIS_URL").ok().as_deref())
        .context("invalid REDIS_URL")?;

    let pool = create_pool(&database_url)
        .await
        .context("Failed to connect to Postgres")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;

    let host = HostManager::get_host(&config).with_context(|| {
        format!(
            "HOSTPLANE_HOST={} is not available in this build (compiled: {:?})",
            config.host_kind,
            HostManager::available()
        )
    })?;

    let job_dispatch = config.job_dispatch;
    let store: Arc<dyn VmStore> = Arc::new(PgStore::new(pool));
    let runtime = assemble(store.clone(), host, config, redis_client)?;

    // In local mode this process executes backup/restore jobs, so it also owns
    // their recovery and requeue.
    if job_dispatch == DispatchMode::Local {
        recovery_job::recover_interrupted_jobs(store.as_ref()).await?;
        let local: Arc<dyn JobDispatcher> = runtime.local.clone();
        tokio::spawn(async move {
            backup_job::run(store, local).await;
        });
    }

    let state = AppState::new(runtime.orchestrator);
    let app = create_router().layer(create_cors()).with_state(state);

    let addr = api_addr()?;
    info!("Hostplane API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
