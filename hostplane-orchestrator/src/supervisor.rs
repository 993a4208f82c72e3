//! Hypervisor process lifecycle: start, stop, restart and liveness reconciliation.
//!
//! Callers serialise operations per VM (see [`crate::locks::VmLocks`]); nothing
//! here caches pid or status between calls.

use hostplane_common::{BackupStatus, OrchestratorError, VirtualMachine};
use hostplane_host::{HypervisorHost, LaunchSpec, StopSignal};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command;
use crate::config::OrchestratorConfig;
use crate::state_machine;
use crate::store::VmStore;

#[derive(Clone)]
pub struct ProcessSupervisor {
    store: Arc<dyn VmStore>,
    host: Arc<dyn HypervisorHost>,
    config: Arc<OrchestratorConfig>,
}

impl ProcessSupervisor {
    pub fn new(
        store: Arc<dyn VmStore>,
        host: Arc<dyn HypervisorHost>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self { store, host, config }
    }

    async fn load(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        self.store
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| OrchestratorError::vm_not_found(vm_id))
    }

    /// Pure read of the persisted belief.
    pub async fn status(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        self.load(vm_id).await
    }

    /// If the VM is believed running but its pid is gone, correct the record to
    /// stopped. Writes nothing when belief and observation agree.
    pub async fn reconcile(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        let vm = self.load(vm_id).await?;
        if !vm.is_running() {
            return Ok(vm);
        }

        let alive = match vm.pid.and_then(|p| u32::try_from(p).ok()) {
            Some(pid) => self.host.is_alive(pid).await,
            None => false,
        };
        if alive {
            return Ok(vm);
        }

        info!(vm_id = %vm.id, vm = %vm.name, pid = ?vm.pid, "hypervisor process is gone, reconciling to stopped");
        state_machine::running_to_stopped(self.store.as_ref(), &vm, vm.pid, "process exited").await?;
        self.remove_pid_file(&vm).await;
        self.load(vm_id).await
    }

    pub async fn start(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        let vm = self.reconcile(vm_id).await?;
        if vm.is_running() {
            return Err(OrchestratorError::AlreadyRunning(vm.name));
        }
        if let Some(job) = self.store.in_flight_job(vm.id).await? {
            if job.status == BackupStatus::Restoring {
                return Err(OrchestratorError::JobInProgress(vm.name));
            }
        }

        let pid_file = self.config.pid_path(&vm.name);
        let log_path = self.config.log_path(&vm.name);
        let spec = LaunchSpec {
            binary: self.config.qemu_binary.clone(),
            args: command::build_args(&vm, &pid_file, &log_path)?,
            log_path,
            pid_file,
        };
        debug!(vm_id = %vm.id, args = ?spec.args, "launching hypervisor");

        let pid = self
            .host
            .launch(&spec)
            .await
            .map_err(|e| OrchestratorError::LaunchFailed(format!("{:#}", e)))?;

        if !state_machine::to_running(self.store.as_ref(), &vm, pid, "start").await? {
            // Record vanished or changed under us: don't leave an untracked guest behind.
            let _ = self.host.signal(pid, StopSignal::Kill).await;
            return Err(OrchestratorError::InvalidState(format!(
                "VM {} changed while starting",
                vm.name
            )));
        }
        info!(vm_id = %vm.id, vm = %vm.name, pid, "VM started");
        self.load(vm_id).await
    }

    pub async fn stop(&self, vm_id: Uuid, force: bool) -> Result<VirtualMachine, OrchestratorError> {
        let vm = self.load(vm_id).await?;
        let pid = match (vm.is_running(), vm.pid) {
            (true, Some(pid)) => pid,
            _ => return Err(OrchestratorError::NotRunning(vm.name)),
        };

        let signal = if force {
            StopSignal::Kill
        } else {
            StopSignal::Terminate
        };
        let delivered = match u32::try_from(pid) {
            Ok(p) => match self.host.signal(p, signal).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    warn!(vm_id = %vm.id, pid, error = %format!("{:#}", e), "failed to signal hypervisor");
                    false
                }
            },
            Err(_) => false,
        };

        if !delivered {
            debug!(vm_id = %vm.id, pid, "process already gone");
        } else if !force && !self.config.stop_grace.is_zero() {
            // Grace period, then proceed whether or not the guest has exited.
            tokio::time::sleep(self.config.stop_grace).await;
        }

        let reason = if force { "force stop" } else { "stop" };
        state_machine::running_to_stopped(self.store.as_ref(), &vm, Some(pid), reason).await?;
        self.remove_pid_file(&vm).await;
        info!(vm_id = %vm.id, vm = %vm.name, pid, force, "VM stopped");
        self.load(vm_id).await
    }

    /// stop(graceful), pause, start. A VM that was not running is simply started.
    pub async fn restart(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        match self.stop(vm_id, false).await {
            Ok(_) | Err(OrchestratorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.config.restart_pause.is_zero() {
            tokio::time::sleep(self.config.restart_pause).await;
        }
        self.start(vm_id).await
    }

    pub(crate) async fn remove_pid_file(&self, vm: &VirtualMachine) {
        let path = self.config.pid_path(&vm.name);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "could not remove pid file");
            }
        }
    }
}
