use chrono::Utc;
use hostplane_common::bus::JobCommand;
use hostplane_common::{BackupStatus, OrchestratorError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::dispatch::JobDispatcher;
use crate::store::VmStore;

/// How long a queued job may sit unclaimed before it is re-dispatched.
pub const UNCLAIMED_AFTER: Duration = Duration::from_secs(30);

/// job-backup-requeue: re-dispatches backup/restore jobs whose command was lost
/// (e.g. published while no worker was listening). The job row is the queue.
pub async fn run(store: Arc<dyn VmStore>, dispatcher: Arc<dyn JobDispatcher>) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    info!("job-backup-requeue started (unclaimed jobs older than {:?})", UNCLAIMED_AFTER);

    loop {
        interval.tick().await;

        match requeue_unclaimed(store.as_ref(), dispatcher.as_ref(), UNCLAIMED_AFTER).await {
            Ok(count) if count > 0 => info!("job-backup-requeue: re-dispatched {} job(s)", count),
            Ok(_) => {}
            Err(e) => error!("job-backup-requeue error: {}", e),
        }
    }
}

pub async fn requeue_unclaimed(
    store: &dyn VmStore,
    dispatcher: &dyn JobDispatcher,
    older_than: Duration,
) -> Result<usize, OrchestratorError> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::seconds(30));
    let jobs = store.unclaimed_jobs(cutoff).await?;

    let mut dispatched = 0;
    for job in jobs {
        let cmd = match job.status {
            BackupStatus::Creating => JobCommand::backup(job.id),
            BackupStatus::Restoring => JobCommand::restore(job.id),
            _ => continue,
        };
        match dispatcher.dispatch(cmd).await {
            Ok(()) => dispatched += 1,
            Err(e) => error!(job_id = %job.id, error = %format!("{:#}", e), "re-dispatch failed"),
        }
    }
    Ok(dispatched)
}
