use anyhow::Result;
use async_trait::async_trait;
use hostplane_common::bus::{JobCommand, CHANNEL_ORCHESTRATOR_COMMANDS};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::backup::BackupWorker;

/// Hands a queued job to whatever will execute it.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, cmd: JobCommand) -> Result<()>;
}

/// Runs jobs as tokio tasks in this process, at most `concurrency` at a time.
pub struct LocalDispatcher {
    worker: Arc<BackupWorker>,
    permits: Arc<Semaphore>,
}

impl LocalDispatcher {
    pub fn new(worker: Arc<BackupWorker>, concurrency: usize) -> Self {
        Self {
            worker,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl JobDispatcher for LocalDispatcher {
    async fn dispatch(&self, cmd: JobCommand) -> Result<()> {
        let worker = self.worker.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            debug!(job_id = %cmd.job_id, kind = cmd.command_type.as_str(), "executing job");
            worker.execute(cmd.job_id).await;
        });
        Ok(())
    }
}

/// Publishes CMD:BACKUP / CMD:RESTORE on the orchestrator command channel.
pub struct RedisDispatcher {
    client: redis::Client,
}

impl RedisDispatcher {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobDispatcher for RedisDispatcher {
    async fn dispatch(&self, cmd: JobCommand) -> Result<()> {
        let payload = serde_json::to_string(&cmd)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::AsyncCommands::publish::<_, _, ()>(&mut conn, CHANNEL_ORCHESTRATOR_COMMANDS, payload)
            .await?;
        debug!(job_id = %cmd.job_id, kind = cmd.command_type.as_str(), "job published");
        Ok(())
    }
}
