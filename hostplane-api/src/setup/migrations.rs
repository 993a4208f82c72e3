use sqlx::Pool;
use sqlx::Postgres;
use tracing::{error, info, warn};

/// Run database migrations and verify the tables the API needs exist
pub async fn run_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    if let Err(e) = sqlx::migrate!("../sqlx-migrations").run(pool).await {
        // The orchestrator daemon may have applied them concurrently.
        warn!("Migration error (may be safe to ignore if migrations were applied elsewhere): {}", e);

        let tables_exist: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'vms')
                AND EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'backup_jobs')",
        )
        .fetch_one(pool)
        .await
        .unwrap_or(false);

        if !tables_exist {
            error!("Critical tables 'vms'/'backup_jobs' do not exist - migrations must be applied!");
            return Err(e);
        }
        info!("Critical tables exist - continuing despite migration error");
    }

    Ok(())
}
