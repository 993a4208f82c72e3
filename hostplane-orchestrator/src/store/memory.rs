use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostplane_common::{
    BackupJob, BackupStatus, OrchestratorError, VirtualMachine, VmStatus, VmTransition,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{NewBackupJob, NewVm, PortRange, StoreResult, VmLease, VmSpecUpdate, VmStore};
use crate::allocator;

#[derive(Default)]
struct Inner {
    vms: HashMap<Uuid, VirtualMachine>,
    jobs: HashMap<Uuid, BackupJob>,
    transitions: Vec<VmTransition>,
}

/// Mutex-guarded in-process store. Same contract as [`super::PgStore`]; every
/// operation runs under one lock, which gives the atomic allocate-then-insert.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    writes: AtomicU64,
    leases: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutations applied so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of VM leases handed out so far.
    pub fn lease_count(&self) -> u64 {
        self.leases.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn in_flight_for<'a>(inner: &'a Inner, vm_id: Uuid) -> Option<&'a BackupJob> {
    inner
        .jobs
        .values()
        .find(|j| j.vm_id == vm_id && j.status.is_in_flight())
}

#[async_trait]
impl VmStore for MemoryStore {
    async fn lease_vm(&self, _vm_id: Uuid) -> StoreResult<VmLease> {
        self.leases.fetch_add(1, Ordering::SeqCst);
        Ok(VmLease::in_process())
    }

    async fn insert_vm(&self, vm: NewVm, ports: Option<PortRange>) -> StoreResult<VirtualMachine> {
        let mut inner = self.lock();
        if inner.vms.values().any(|v| v.name == vm.name) {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "VM name '{}' is already in use",
                vm.name
            )));
        }
        if inner.vms.values().any(|v| v.uuid == vm.uuid || v.mac_address == vm.mac_address) {
            return Err(OrchestratorError::Store("uuid/mac collision".into()));
        }

        let display_port = match ports {
            Some(range) => {
                let used = inner
                    .vms
                    .values()
                    .filter_map(|v| v.display_port());
                Some(i32::from(allocator::lowest_free_port(used, range)?))
            }
            None => None,
        };

        let now = Utc::now();
        let row = VirtualMachine {
            id: vm.id,
            name: vm.name,
            uuid: vm.uuid,
            mac_address: vm.mac_address,
            cpu_cores: vm.cpu_cores,
            ram_mb: vm.ram_mb,
            disk_path: vm.disk_path,
            disk_size_gb: vm.disk_size_gb,
            disk_format: vm.disk_format,
            disk_provisioned: vm.disk_provisioned,
            physical_disk: vm.physical_disk,
            boot_order: vm.boot_order,
            iso_path: vm.iso_path,
            boot_from_disk: vm.boot_from_disk,
            network_mode: vm.network_mode,
            bridge_name: vm.bridge_name,
            display_protocol: vm.display_protocol,
            display_port,
            display_secret: vm.display_secret,
            status: VmStatus::Stopped,
            pid: None,
            last_started_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.vms.insert(row.id, row.clone());
        drop(inner);
        self.wrote();
        Ok(row)
    }

    async fn get_vm(&self, id: Uuid) -> StoreResult<Option<VirtualMachine>> {
        Ok(self.lock().vms.get(&id).cloned())
    }

    async fn list_vms(&self) -> StoreResult<Vec<VirtualMachine>> {
        let mut vms: Vec<VirtualMachine> = self.lock().vms.values().cloned().collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(vms)
    }

    async fn used_display_ports(&self) -> StoreResult<Vec<u16>> {
        let mut ports: Vec<u16> = self
            .lock()
            .vms
            .values()
            .filter_map(|v| v.display_port())
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    async fn update_vm_spec(&self, id: Uuid, spec: &VmSpecUpdate) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(vm) = inner.vms.get_mut(&id) else {
            return Ok(false);
        };
        if vm.status == VmStatus::Running {
            return Ok(false);
        }
        vm.cpu_cores = spec.cpu_cores;
        vm.ram_mb = spec.ram_mb;
        vm.physical_disk = spec.physical_disk.clone();
        vm.boot_order = spec.boot_order.clone();
        vm.iso_path = spec.iso_path.clone();
        vm.boot_from_disk = spec.boot_from_disk;
        vm.network_mode = spec.network_mode;
        vm.bridge_name = spec.bridge_name.clone();
        vm.display_protocol = spec.display_protocol;
        vm.updated_at = Utc::now();
        drop(inner);
        self.wrote();
        Ok(true)
    }

    async fn mark_running(&self, id: Uuid, pid: u32, started_at: DateTime<Utc>) -> StoreResult<bool> {
        let pid = i32::try_from(pid).map_err(|_| OrchestratorError::Store(format!("pid {} out of range", pid)))?;
        let mut inner = self.lock();
        let Some(vm) = inner.vms.get_mut(&id) else {
            return Ok(false);
        };
        if vm.status == VmStatus::Running {
            return Ok(false);
        }
        vm.status = VmStatus::Running;
        vm.pid = Some(pid);
        vm.last_started_at = Some(started_at);
        vm.updated_at = Utc::now();
        drop(inner);
        self.wrote();
        Ok(true)
    }

    async fn mark_stopped(&self, id: Uuid, expected_pid: Option<i32>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(vm) = inner.vms.get_mut(&id) else {
            return Ok(false);
        };
        if vm.status != VmStatus::Running {
            return Ok(false);
        }
        if expected_pid.is_some() && vm.pid != expected_pid {
            return Ok(false);
        }
        vm.status = VmStatus::Stopped;
        vm.pid = None;
        vm.updated_at = Utc::now();
        drop(inner);
        self.wrote();
        Ok(true)
    }

    async fn delete_vm(&self, id: Uuid) -> StoreResult<bool> {
        let removed = self.lock().vms.remove(&id).is_some();
        if removed {
            self.wrote();
        }
        Ok(removed)
    }

    async fn record_transition(
        &self,
        vm_id: Uuid,
        from: Option<VmStatus>,
        to: VmStatus,
        reason: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let id = inner.transitions.len() as i64 + 1;
        inner.transitions.push(VmTransition {
            id,
            vm_id,
            from_status: from.map(|s| s.as_str().to_string()),
            to_status: to.as_str().to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        });
        drop(inner);
        self.wrote();
        Ok(())
    }

    async fn list_transitions(&self, vm_id: Uuid) -> StoreResult<Vec<VmTransition>> {
        Ok(self
            .lock()
            .transitions
            .iter()
            .filter(|t| t.vm_id == vm_id)
            .cloned()
            .collect())
    }

    async fn insert_backup_job(&self, job: NewBackupJob) -> StoreResult<BackupJob> {
        let mut inner = self.lock();
        if in_flight_for(&inner, job.vm_id).is_some() {
            return Err(OrchestratorError::JobInProgress(job.vm_name));
        }
        let now = Utc::now();
        let row = BackupJob {
            id: job.id,
            vm_id: job.vm_id,
            vm_name: job.vm_name,
            destination_path: job.destination_path,
            size_bytes: None,
            compression: job.compression,
            status: BackupStatus::Creating,
            notes: job.notes,
            error_message: None,
            claimed_at: None,
            created_at: now,
            queued_at: now,
            completed_at: None,
        };
        inner.jobs.insert(row.id, row.clone());
        drop(inner);
        self.wrote();
        Ok(row)
    }

    async fn get_backup_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_backup_jobs(&self, vm_id: Option<Uuid>) -> StoreResult<Vec<BackupJob>> {
        let mut jobs: Vec<BackupJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| vm_id.map_or(true, |id| j.vm_id == id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(jobs)
    }

    async fn in_flight_job(&self, vm_id: Uuid) -> StoreResult<Option<BackupJob>> {
        Ok(in_flight_for(&self.lock(), vm_id).cloned())
    }

    async fn begin_restore(&self, id: Uuid) -> StoreResult<BackupJob> {
        let mut inner = self.lock();
        let (vm_id, vm_name, status) = match inner.jobs.get(&id) {
            Some(j) => (j.vm_id, j.vm_name.clone(), j.status),
            None => return Err(OrchestratorError::job_not_found(id)),
        };
        if status != BackupStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "backup job {} is {}, only completed backups can be restored",
                id,
                status.as_str()
            )));
        }
        if in_flight_for(&inner, vm_id).is_some() {
            return Err(OrchestratorError::JobInProgress(vm_name));
        }
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Err(OrchestratorError::job_not_found(id));
        };
        job.status = BackupStatus::Restoring;
        job.claimed_at = None;
        job.error_message = None;
        job.queued_at = Utc::now();
        let row = job.clone();
        drop(inner);
        self.wrote();
        Ok(row)
    }

    async fn claim_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.status.is_in_flight() || job.claimed_at.is_some() {
            return Ok(None);
        }
        job.claimed_at = Some(Utc::now());
        let row = job.clone();
        drop(inner);
        self.wrote();
        Ok(Some(row))
    }

    async fn complete_job(&self, id: Uuid, size_bytes: Option<i64>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.status.is_in_flight() {
            return Ok(false);
        }
        job.status = BackupStatus::Completed;
        if size_bytes.is_some() {
            job.size_bytes = size_bytes;
        }
        job.completed_at = Some(Utc::now());
        drop(inner);
        self.wrote();
        Ok(true)
    }

    async fn fail_job(&self, id: Uuid, note: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.status.is_in_flight() {
            return Ok(false);
        }
        job.status = BackupStatus::Failed;
        job.error_message = Some(note.to_string());
        job.completed_at = Some(Utc::now());
        drop(inner);
        self.wrote();
        Ok(true)
    }

    async fn delete_backup_job(&self, id: Uuid) -> StoreResult<bool> {
        let removed = self.lock().jobs.remove(&id).is_some();
        if removed {
            self.wrote();
        }
        Ok(removed)
    }

    async fn unclaimed_jobs(&self, queued_before: DateTime<Utc>) -> StoreResult<Vec<BackupJob>> {
        let mut jobs: Vec<BackupJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status.is_in_flight() && j.claimed_at.is_none() && j.queued_at < queued_before)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.queued_at);
        Ok(jobs)
    }

    async fn fail_interrupted_jobs(&self, note: &str) -> StoreResult<u64> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut n = 0;
        for job in inner.jobs.values_mut() {
            if job.status.is_in_flight() && job.claimed_at.is_some() {
                job.status = BackupStatus::Failed;
                job.error_message = Some(note.to_string());
                job.completed_at = Some(now);
                n += 1;
            }
        }
        drop(inner);
        if n > 0 {
            self.wrote();
        }
        Ok(n)
    }
}
