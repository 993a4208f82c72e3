//! VM lifecycle and resource orchestration for a single hypervisor host.
//!
//! [`Orchestrator`] is the facade the API and the daemon drive; everything
//! below it talks to the database through [`store::VmStore`] and to the
//! machine through [`hostplane_host::HypervisorHost`].

pub mod allocator;
pub mod backup;
pub mod backup_job;
pub mod command;
pub mod config;
pub mod disk;
pub mod dispatch;
pub mod display;
pub mod host_manager;
pub mod inventory;
pub mod locks;
pub mod recovery_job;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod supervisor;
pub mod validate;
pub mod watch_dog_job;

use hostplane_common::OrchestratorError;
use hostplane_host::HypervisorHost;
use std::sync::Arc;

pub use config::{DispatchMode, OrchestratorConfig};
pub use service::Orchestrator;

use backup::BackupWorker;
use dispatch::{JobDispatcher, LocalDispatcher, RedisDispatcher};
use store::VmStore;

/// A wired orchestrator plus the in-process executor for backup/restore jobs.
pub struct Runtime {
    pub orchestrator: Arc<Orchestrator>,
    /// Always runs jobs here, whatever `job_dispatch` says. Daemons feed it
    /// from Redis and from the requeue loop.
    pub local: Arc<LocalDispatcher>,
}

pub fn assemble(
    store: Arc<dyn VmStore>,
    host: Arc<dyn HypervisorHost>,
    config: OrchestratorConfig,
    redis_client: Option<redis::Client>,
) -> Result<Runtime, OrchestratorError> {
    config.validate()?;

    let worker = Arc::new(BackupWorker::new(store.clone()));
    let local = Arc::new(LocalDispatcher::new(worker, config.job_concurrency));

    let dispatcher: Arc<dyn JobDispatcher> = match config.job_dispatch {
        DispatchMode::Local => local.clone(),
        DispatchMode::Redis => {
            let client = redis_client.ok_or_else(|| {
                OrchestratorError::InvalidConfiguration(
                    "HOSTPLANE_JOB_DISPATCH=redis requires REDIS_URL".into(),
                )
            })?;
            Arc::new(RedisDispatcher::new(client))
        }
    };

    Ok(Runtime {
        orchestrator: Arc::new(Orchestrator::new(store, host, dispatcher, config)),
        local,
    })
}
