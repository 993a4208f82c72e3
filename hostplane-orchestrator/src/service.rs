//! Public operations of the orchestrator, one per API verb.
//!
//! Each mutating operation on an existing VM runs under that VM's in-process
//! lock and its store lease, so it is serialised against the same VM in every
//! process sharing the store. Creation runs under the host-wide creation lock.

use hostplane_common::{
    BackupJob, BackupStatus, IsoImage, NetworkBridge, OrchestratorError, PhysicalDisk,
    VirtualMachine, VmRuntimeStatus, VmSpec, VmSpecPatch, VmStatus, VmTransition,
};
use hostplane_host::HypervisorHost;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator;
use crate::backup::BackupOrchestrator;
use crate::config::OrchestratorConfig;
use crate::disk::DiskProvisioner;
use crate::dispatch::JobDispatcher;
use crate::display::{self, ViewerFile};
use crate::inventory;
use crate::locks::VmLocks;
use crate::state_machine;
use crate::store::{NewVm, VmSpecUpdate, VmStore};
use crate::supervisor::ProcessSupervisor;
use crate::validate;

/// Upper bound for `logs(.., lines)`.
pub const MAX_LOG_LINES: usize = 10_000;

pub struct Orchestrator {
    store: Arc<dyn VmStore>,
    host: Arc<dyn HypervisorHost>,
    config: Arc<OrchestratorConfig>,
    locks: VmLocks,
    disks: DiskProvisioner,
    supervisor: ProcessSupervisor,
    backups: BackupOrchestrator,
}

fn empty_to_none(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn VmStore>,
        host: Arc<dyn HypervisorHost>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            disks: DiskProvisioner::new(host.clone()),
            supervisor: ProcessSupervisor::new(store.clone(), host.clone(), config.clone()),
            backups: BackupOrchestrator::new(store.clone(), dispatcher, config.clone()),
            locks: VmLocks::new(),
            store,
            host,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VmStore> {
        &self.store
    }

    /// Run `op` as the only lifecycle operation on `vm_id`.
    async fn exclusive<T, F>(&self, vm_id: Uuid, op: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        let _guard = self.locks.lock(vm_id).await;
        let lease = self.store.lease_vm(vm_id).await?;
        let result = op.await;
        if let Err(e) = lease.release().await {
            warn!(vm_id = %vm_id, error = %e, "failed to release VM lease");
        }
        result
    }

    async fn load(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        self.store
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| OrchestratorError::vm_not_found(vm_id))
    }

    // --- VM records ---

    pub async fn list_vms(&self) -> Result<Vec<VirtualMachine>, OrchestratorError> {
        self.store.list_vms().await
    }

    pub async fn get_vm(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        self.load(vm_id).await
    }

    pub async fn create(&self, spec: VmSpec) -> Result<VirtualMachine, OrchestratorError> {
        validate::validate_spec(&spec)?;
        let _host_guard = self.locks.creation().await;

        // Checked before provisioning so a duplicate never touches the disk.
        if self.store.list_vms().await?.iter().any(|v| v.name == spec.name) {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "VM name '{}' is already in use",
                spec.name
            )));
        }

        let identity = allocator::allocate_identity();
        let existing_disk = empty_to_none(spec.disk_path.clone());
        let (disk_path, provisioned): (Option<PathBuf>, bool) = match (existing_disk, spec.disk_size_gb) {
            (Some(path), _) => (Some(PathBuf::from(path)), false),
            (None, Some(size_gb)) => {
                let path = self.config.disk_path(&spec.name, spec.disk_format);
                let size_gb = u32::try_from(size_gb).map_err(|_| {
                    OrchestratorError::InvalidConfiguration("disk_size_gb must be positive".into())
                })?;
                self.disks
                    .create_disk_image(&path, size_gb, spec.disk_format)
                    .await?;
                (Some(path), true)
            }
            (None, None) => (None, false),
        };

        let ports = spec
            .display_protocol
            .needs_port()
            .then(|| self.config.port_range());
        let new_vm = NewVm {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            uuid: identity.uuid,
            mac_address: identity.mac_address,
            cpu_cores: spec.cpu_cores,
            ram_mb: spec.ram_mb,
            disk_path: disk_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            disk_size_gb: spec.disk_size_gb,
            disk_format: spec.disk_format,
            disk_provisioned: provisioned,
            physical_disk: empty_to_none(spec.physical_disk),
            boot_order: spec.boot_order.trim().to_string(),
            iso_path: empty_to_none(spec.iso_path),
            boot_from_disk: spec.boot_from_disk,
            network_mode: spec.network_mode,
            bridge_name: empty_to_none(spec.bridge_name),
            display_protocol: spec.display_protocol,
            display_secret: allocator::generate_secret(),
        };

        let vm = match self.store.insert_vm(new_vm, ports).await {
            Ok(vm) => vm,
            Err(e) => {
                if let (true, Some(path)) = (provisioned, disk_path.as_ref()) {
                    if let Err(cleanup) = self.disks.delete_disk_image(path).await {
                        warn!(path = %path.display(), error = %cleanup, "failed to clean up image after insert failure");
                    }
                }
                return Err(e);
            }
        };

        state_machine::created(self.store.as_ref(), &vm).await;
        info!(vm_id = %vm.id, vm = %vm.name, port = ?vm.display_port, "VM created");
        Ok(vm)
    }

    pub async fn update(
        &self,
        vm_id: Uuid,
        patch: VmSpecPatch,
    ) -> Result<VirtualMachine, OrchestratorError> {
        self.exclusive(vm_id, self.apply_patch(vm_id, patch)).await
    }

    async fn apply_patch(
        &self,
        vm_id: Uuid,
        patch: VmSpecPatch,
    ) -> Result<VirtualMachine, OrchestratorError> {
        let vm = self.supervisor.reconcile(vm_id).await?;
        if vm.is_running() {
            return Err(OrchestratorError::AlreadyRunning(vm.name));
        }
        if patch.is_empty() {
            return Ok(vm);
        }

        let mut next = VmSpecUpdate::from_vm(&vm);
        if let Some(v) = patch.cpu_cores {
            next.cpu_cores = v;
        }
        if let Some(v) = patch.ram_mb {
            next.ram_mb = v;
        }
        if let Some(v) = patch.physical_disk {
            next.physical_disk = empty_to_none(Some(v));
        }
        if let Some(v) = patch.boot_order {
            next.boot_order = v.trim().to_string();
        }
        if let Some(v) = patch.iso_path {
            next.iso_path = empty_to_none(Some(v));
        }
        if let Some(v) = patch.boot_from_disk {
            next.boot_from_disk = v;
        }
        if let Some(v) = patch.network_mode {
            next.network_mode = v;
        }
        if let Some(v) = patch.bridge_name {
            next.bridge_name = empty_to_none(Some(v));
        }
        if let Some(v) = patch.display_protocol {
            // The port is allocated at creation only.
            if v.needs_port() && vm.display_port.is_none() {
                return Err(OrchestratorError::InvalidConfiguration(format!(
                    "VM {} was created without a display port; {} is not available",
                    vm.name,
                    v.as_str()
                )));
            }
            next.display_protocol = v;
        }
        validate::validate_update(&next)?;

        if !self.store.update_vm_spec(vm_id, &next).await? {
            return Err(OrchestratorError::AlreadyRunning(vm.name));
        }
        info!(vm_id = %vm_id, "VM spec updated");
        self.load(vm_id).await
    }

    pub async fn delete(&self, vm_id: Uuid) -> Result<(), OrchestratorError> {
        let name = self.exclusive(vm_id, self.remove_vm(vm_id)).await?;
        self.locks.forget(vm_id);
        info!(vm_id = %vm_id, vm = %name, "VM deleted");
        Ok(())
    }

    async fn remove_vm(&self, vm_id: Uuid) -> Result<String, OrchestratorError> {
        let vm = self.load(vm_id).await?;
        if self.store.in_flight_job(vm_id).await?.is_some() {
            return Err(OrchestratorError::JobInProgress(vm.name));
        }

        if vm.is_running() {
            match self.supervisor.stop(vm_id, true).await {
                Ok(_) | Err(OrchestratorError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if vm.disk_provisioned {
            if let Some(path) = vm.disk_path.as_deref() {
                self.disks.delete_disk_image(&PathBuf::from(path)).await?;
            }
        }
        self.supervisor.remove_pid_file(&vm).await;

        self.store.delete_vm(vm_id).await?;
        Ok(vm.name)
    }

    // --- Process lifecycle ---

    pub async fn start(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        self.exclusive(vm_id, self.supervisor.start(vm_id)).await
    }

    pub async fn stop(&self, vm_id: Uuid, force: bool) -> Result<VirtualMachine, OrchestratorError> {
        self.exclusive(vm_id, self.supervisor.stop(vm_id, force)).await
    }

    pub async fn restart(&self, vm_id: Uuid) -> Result<VirtualMachine, OrchestratorError> {
        self.exclusive(vm_id, self.supervisor.restart(vm_id)).await
    }

    /// Persisted belief only; no liveness check, no writes.
    pub async fn status(&self, vm_id: Uuid) -> Result<VmRuntimeStatus, OrchestratorError> {
        Ok(VmRuntimeStatus::from(&self.supervisor.status(vm_id).await?))
    }

    /// Status after correcting a dead `running` VM to `stopped`. The correction
    /// is a compare-and-set on the pid, so no store lease is taken.
    pub async fn reconcile(&self, vm_id: Uuid) -> Result<VmRuntimeStatus, OrchestratorError> {
        let _guard = self.locks.lock(vm_id).await;
        Ok(VmRuntimeStatus::from(&self.supervisor.reconcile(vm_id).await?))
    }

    /// Reconcile every VM believed running. Returns how many were corrected.
    pub async fn reconcile_all(&self) -> Result<usize, OrchestratorError> {
        let running: Vec<Uuid> = self
            .store
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.is_running())
            .map(|vm| vm.id)
            .collect();

        let mut corrected = 0;
        for vm_id in running {
            match self.reconcile(vm_id).await {
                Ok(status) if status.status != VmStatus::Running => corrected += 1,
                Ok(_) => {}
                Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => warn!(vm_id = %vm_id, error = %e, "reconcile failed"),
            }
        }
        Ok(corrected)
    }

    pub async fn transitions(&self, vm_id: Uuid) -> Result<Vec<VmTransition>, OrchestratorError> {
        self.load(vm_id).await?;
        self.store.list_transitions(vm_id).await
    }

    /// Last `lines` lines (capped at [`MAX_LOG_LINES`]) of the VM's hypervisor output.
    pub async fn logs(&self, vm_id: Uuid, lines: usize) -> Result<String, OrchestratorError> {
        let vm = self.load(vm_id).await?;
        let lines = lines.min(MAX_LOG_LINES);
        if lines == 0 {
            return Ok(String::new());
        }
        let raw = match tokio::fs::read(self.config.log_path(&vm.name)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&raw);
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }

    // --- Host inventory ---

    pub async fn list_isos(&self) -> Result<Vec<IsoImage>, OrchestratorError> {
        inventory::list_isos(&self.config.iso_dir).await
    }

    pub async fn list_physical_disks(&self) -> Result<Vec<PhysicalDisk>, OrchestratorError> {
        inventory::list_physical_disks(self.host.as_ref()).await
    }

    pub async fn list_network_bridges(&self) -> Result<Vec<NetworkBridge>, OrchestratorError> {
        inventory::list_network_bridges(self.host.as_ref()).await
    }

    // --- Backups ---

    pub async fn create_backup(
        &self,
        vm_id: Uuid,
        notes: Option<String>,
    ) -> Result<BackupJob, OrchestratorError> {
        self.exclusive(vm_id, async {
            let vm = self.supervisor.reconcile(vm_id).await?;
            self.backups.create_backup(&vm, notes).await
        })
        .await
    }

    pub async fn list_backups(&self, vm_id: Uuid) -> Result<Vec<BackupJob>, OrchestratorError> {
        self.backups.list_backups(Some(vm_id)).await
    }

    pub async fn list_all_backups(&self) -> Result<Vec<BackupJob>, OrchestratorError> {
        self.backups.list_backups(None).await
    }

    pub async fn get_backup(&self, job_id: Uuid) -> Result<BackupJob, OrchestratorError> {
        self.backups.get_job(job_id).await
    }

    pub async fn check_backup_status(&self, job_id: Uuid) -> Result<BackupStatus, OrchestratorError> {
        self.backups.check_backup_status(job_id).await
    }

    pub async fn restore_backup(&self, job_id: Uuid) -> Result<BackupJob, OrchestratorError> {
        let vm_id = self.backups.get_job(job_id).await?.vm_id;
        self.exclusive(vm_id, async {
            // Re-read under the lease.
            let job = self.backups.get_job(job_id).await?;
            let vm = self.supervisor.reconcile(vm_id).await?;
            self.backups.restore_backup(&job, &vm).await
        })
        .await
    }

    pub async fn delete_backup(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let vm_id = self.backups.get_job(job_id).await?.vm_id;
        self.exclusive(vm_id, self.backups.delete_backup(job_id)).await
    }

    // --- Display ---

    pub async fn generate_spice_file(&self, vm_id: Uuid) -> Result<ViewerFile, OrchestratorError> {
        let vm = self.load(vm_id).await?;
        display::viewer_file(&vm, &self.config.display_host)
    }
}
