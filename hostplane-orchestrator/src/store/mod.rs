//! Storage port for VM and backup-job records.
//!
//! The store is the source of truth between calls: components re-read through it
//! instead of caching status or pids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tokio::sync::OwnedSemaphorePermit;
use hostplane_common::{
    BackupCompression, BackupJob, DiskFormat, DisplayProtocol, NetworkMode, OrchestratorError,
    VirtualMachine, VmStatus, VmTransition,
};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, OrchestratorError>;

/// Inclusive display port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Exclusive hold on one VM across every process sharing the store.
///
/// Backed by a transaction-scoped advisory lock for [`PgStore`]; dropping the
/// lease without [`VmLease::release`] rolls the transaction back, which also
/// frees the lock.
pub struct VmLease {
    tx: Option<Transaction<'static, Postgres>>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl VmLease {
    /// Lease for stores only reachable from this process.
    pub fn in_process() -> Self {
        Self { tx: None, _slot: None }
    }

    pub(crate) fn advisory(tx: Transaction<'static, Postgres>, slot: OwnedSemaphorePermit) -> Self {
        Self {
            tx: Some(tx),
            _slot: Some(slot),
        }
    }

    pub async fn release(self) -> StoreResult<()> {
        if let Some(tx) = self.tx {
            tx.commit().await?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NewVm {
    pub id: Uuid,
    pub name: String,
    pub uuid: Uuid,
    pub mac_address: String,
    pub cpu_cores: i32,
    pub ram_mb: i32,
    pub disk_path: Option<String>,
    pub disk_size_gb: Option<i32>,
    pub disk_format: DiskFormat,
    pub disk_provisioned: bool,
    pub physical_disk: Option<String>,
    pub boot_order: String,
    pub iso_path: Option<String>,
    pub boot_from_disk: bool,
    pub network_mode: NetworkMode,
    pub bridge_name: Option<String>,
    pub display_protocol: DisplayProtocol,
    pub display_secret: String,
}

/// Mutable part of a VM's spec, fully resolved (not a patch).
#[derive(Clone, Debug, PartialEq)]
pub struct VmSpecUpdate {
    pub cpu_cores: i32,
    pub ram_mb: i32,
    pub physical_disk: Option<String>,
    pub boot_order: String,
    pub iso_path: Option<String>,
    pub boot_from_disk: bool,
    pub network_mode: NetworkMode,
    pub bridge_name: Option<String>,
    pub display_protocol: DisplayProtocol,
}

impl VmSpecUpdate {
    pub fn from_vm(vm: &VirtualMachine) -> Self {
        Self {
            cpu_cores: vm.cpu_cores,
            ram_mb: vm.ram_mb,
            physical_disk: vm.physical_disk.clone(),
            boot_order: vm.boot_order.clone(),
            iso_path: vm.iso_path.clone(),
            boot_from_disk: vm.boot_from_disk,
            network_mode: vm.network_mode,
            bridge_name: vm.bridge_name.clone(),
            display_protocol: vm.display_protocol,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewBackupJob {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub vm_name: String,
    pub destination_path: String,
    pub compression: BackupCompression,
    pub notes: Option<String>,
}

#[async_trait]
pub trait VmStore: Send + Sync {
    /// Wait for exclusive use of `vm_id`. Held for a whole lifecycle operation.
    async fn lease_vm(&self, vm_id: Uuid) -> StoreResult<VmLease>;

    // --- VMs ---

    /// Insert a VM, allocating the lowest free display port of `ports` atomically
    /// with the insert. `ResourceExhausted` when the range is full,
    /// `InvalidConfiguration` when the name is taken.
    async fn insert_vm(&self, vm: NewVm, ports: Option<PortRange>) -> StoreResult<VirtualMachine>;
    async fn get_vm(&self, id: Uuid) -> StoreResult<Option<VirtualMachine>>;
    async fn list_vms(&self) -> StoreResult<Vec<VirtualMachine>>;
    async fn used_display_ports(&self) -> StoreResult<Vec<u16>>;
    /// Applies only while the VM is not running. Returns whether a row changed.
    async fn update_vm_spec(&self, id: Uuid, spec: &VmSpecUpdate) -> StoreResult<bool>;
    /// `* -> running` for a VM not already running.
    async fn mark_running(&self, id: Uuid, pid: u32, started_at: DateTime<Utc>) -> StoreResult<bool>;
    /// `running -> stopped`, clearing the pid. With `expected_pid`, only if the
    /// stored pid still matches (compare-and-set).
    async fn mark_stopped(&self, id: Uuid, expected_pid: Option<i32>) -> StoreResult<bool>;
    async fn delete_vm(&self, id: Uuid) -> StoreResult<bool>;

    // --- History ---

    async fn record_transition(
        &self,
        vm_id: Uuid,
        from: Option<VmStatus>,
        to: VmStatus,
        reason: &str,
    ) -> StoreResult<()>;
    async fn list_transitions(&self, vm_id: Uuid) -> StoreResult<Vec<VmTransition>>;

    // --- Backup jobs ---

    /// Insert in `creating`. `JobInProgress` if the VM already has a creating/restoring job.
    async fn insert_backup_job(&self, job: NewBackupJob) -> StoreResult<BackupJob>;
    async fn get_backup_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>>;
    /// Newest first.
    async fn list_backup_jobs(&self, vm_id: Option<Uuid>) -> StoreResult<Vec<BackupJob>>;
    async fn in_flight_job(&self, vm_id: Uuid) -> StoreResult<Option<BackupJob>>;
    /// `completed -> restoring` and requeue. `InvalidState` unless completed,
    /// `JobInProgress` if another job of the VM is in flight.
    async fn begin_restore(&self, id: Uuid) -> StoreResult<BackupJob>;
    /// Lease an in-flight, unclaimed job. `None` if someone else got it first.
    async fn claim_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>>;
    /// `creating|restoring -> completed`. A `None` size keeps the stored one.
    async fn complete_job(&self, id: Uuid, size_bytes: Option<i64>) -> StoreResult<bool>;
    async fn fail_job(&self, id: Uuid, note: &str) -> StoreResult<bool>;
    async fn delete_backup_job(&self, id: Uuid) -> StoreResult<bool>;
    /// In-flight jobs no worker claimed, queued before `queued_before`.
    async fn unclaimed_jobs(&self, queued_before: DateTime<Utc>) -> StoreResult<Vec<BackupJob>>;
    /// Fail every claimed in-flight job. Returns how many were failed.
    async fn fail_interrupted_jobs(&self, note: &str) -> StoreResult<u64>;
}
