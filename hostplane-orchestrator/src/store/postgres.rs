use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostplane_common::{BackupJob, OrchestratorError, VirtualMachine, VmStatus, VmTransition};
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::{NewBackupJob, NewVm, PortRange, StoreResult, VmLease, VmSpecUpdate, VmStore};
use crate::allocator;

/// Advisory lock key serialising display-port allocation host-wide.
const PORT_ALLOCATION_LOCK: i64 = 0x6870_6f72_7473; // "hports"

/// First key of the two-key advisory lock taken per VM; the second is `hashtext(vm_id)`.
const VM_LEASE_CLASS: i32 = 0x6876_6d6c; // "hvml"

const VM_COLUMNS: &str = "id, name, uuid, mac_address, cpu_cores, ram_mb, disk_path, disk_size_gb,
    disk_format, disk_provisioned, physical_disk, boot_order, iso_path, boot_from_disk,
    network_mode, bridge_name, display_protocol, display_port, display_secret, status, pid,
    last_started_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, vm_id, vm_name, destination_path, size_bytes, compression, status,
    notes, error_message, claimed_at, created_at, queued_at, completed_at";

pub struct PgStore {
    db: Pool<Postgres>,
    // A lease pins a pool connection; at most half the pool may be pinned so the
    // work done under leases can still get connections.
    lease_slots: Arc<Semaphore>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        let max = db.options().get_max_connections() as usize;
        Self {
            lease_slots: Arc::new(Semaphore::new((max / 2).max(1))),
            db,
        }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.db
    }
}

fn constraint_of(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .and_then(|d| d.constraint())
        .map(|c| c.to_string())
}

#[async_trait]
impl VmStore for PgStore {
    async fn lease_vm(&self, vm_id: Uuid) -> StoreResult<VmLease> {
        let slot = self
            .lease_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::InvalidState("store is shutting down".into()))?;
        let mut tx = self.db.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
            .bind(VM_LEASE_CLASS)
            .bind(vm_id.to_string())
            .execute(&mut *tx)
            .await?;
        Ok(VmLease::advisory(tx, slot))
    }

    async fn insert_vm(&self, vm: NewVm, ports: Option<PortRange>) -> StoreResult<VirtualMachine> {
        let mut tx = self.db.begin().await?;

        // Held until commit: no other allocator can read the port set in between.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PORT_ALLOCATION_LOCK)
            .execute(&mut *tx)
            .await?;

        let display_port = match ports {
            Some(range) => {
                let used: Vec<i32> = sqlx::query_scalar(
                    "SELECT display_port FROM vms WHERE display_port IS NOT NULL",
                )
                .fetch_all(&mut *tx)
                .await?;
                let used = used.into_iter().filter_map(|p| u16::try_from(p).ok());
                Some(i32::from(allocator::lowest_free_port(used, range)?))
            }
            None => None,
        };

        let sql = format!(
            "INSERT INTO vms (
                id, name, uuid, mac_address, cpu_cores, ram_mb, disk_path, disk_size_gb,
                disk_format, disk_provisioned, physical_disk, boot_order, iso_path, boot_from_disk,
                network_mode, bridge_name, display_protocol, display_port, display_secret, status
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, 'stopped')
             RETURNING {}",
            VM_COLUMNS
        );
        let name = vm.name.clone();
        let row = sqlx::query_as::<_, VirtualMachine>(&sql)
            .bind(vm.id)
            .bind(&vm.name)
            .bind(vm.uuid)
            .bind(&vm.mac_address)
            .bind(vm.cpu_cores)
            .bind(vm.ram_mb)
            .bind(&vm.disk_path)
            .bind(vm.disk_size_gb)
            .bind(vm.disk_format)
            .bind(vm.disk_provisioned)
            .bind(&vm.physical_disk)
            .bind(&vm.boot_order)
            .bind(&vm.iso_path)
            .bind(vm.boot_from_disk)
            .bind(vm.network_mode)
            .bind(&vm.bridge_name)
            .bind(vm.display_protocol)
            .bind(display_port)
            .bind(&vm.display_secret)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match constraint_of(&e).as_deref() {
                Some("vms_name_key") => OrchestratorError::InvalidConfiguration(format!(
                    "VM name '{}' is already in use",
                    name
                )),
                _ => OrchestratorError::from(e),
            })?;

        tx.commit().await?;
        Ok(row)
    }

    async fn get_vm(&self, id: Uuid) -> StoreResult<Option<VirtualMachine>> {
        let sql = format!("SELECT {} FROM vms WHERE id = $1", VM_COLUMNS);
        Ok(sqlx::query_as::<_, VirtualMachine>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_vms(&self) -> StoreResult<Vec<VirtualMachine>> {
        let sql = format!("SELECT {} FROM vms ORDER BY created_at, name", VM_COLUMNS);
        Ok(sqlx::query_as::<_, VirtualMachine>(&sql)
            .fetch_all(&self.db)
            .await?)
    }

    async fn used_display_ports(&self) -> StoreResult<Vec<u16>> {
        let ports: Vec<i32> = sqlx::query_scalar(
            "SELECT display_port FROM vms WHERE display_port IS NOT NULL ORDER BY display_port",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(ports.into_iter().filter_map(|p| u16::try_from(p).ok()).collect())
    }

    async fn update_vm_spec(&self, id: Uuid, spec: &VmSpecUpdate) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE vms
             SET cpu_cores = $2,
                 ram_mb = $3,
                 physical_disk = $4,
                 boot_order = $5,
                 iso_path = $6,
                 boot_from_disk = $7,
                 network_mode = $8,
                 bridge_name = $9,
                 display_protocol = $10,
                 updated_at = NOW()
             WHERE id = $1 AND status <> 'running'",
        )
        .bind(id)
        .bind(spec.cpu_cores)
        .bind(spec.ram_mb)
        .bind(&spec.physical_disk)
        .bind(&spec.boot_order)
        .bind(&spec.iso_path)
        .bind(spec.boot_from_disk)
        .bind(spec.network_mode)
        .bind(&spec.bridge_name)
        .bind(spec.display_protocol)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn mark_running(&self, id: Uuid, pid: u32, started_at: DateTime<Utc>) -> StoreResult<bool> {
        let pid = i32::try_from(pid)
            .map_err(|_| OrchestratorError::Store(format!("pid {} out of range", pid)))?;
        let res = sqlx::query(
            "UPDATE vms
             SET status = 'running', pid = $2, last_started_at = $3, updated_at = NOW()
             WHERE id = $1 AND status <> 'running'",
        )
        .bind(id)
        .bind(pid)
        .bind(started_at)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn mark_stopped(&self, id: Uuid, expected_pid: Option<i32>) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE vms
             SET status = 'stopped', pid = NULL, updated_at = NOW()
             WHERE id = $1
               AND status = 'running'
               AND ($2::int IS NULL OR pid = $2)",
        )
        .bind(id)
        .bind(expected_pid)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_vm(&self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM vms WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn record_transition(
        &self,
        vm_id: Uuid,
        from: Option<VmStatus>,
        to: VmStatus,
        reason: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO vm_state_history (vm_id, from_status, to_status, reason)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(vm_id)
        .bind(from.map(|s| s.as_str()))
        .bind(to.as_str())
        .bind(reason)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_transitions(&self, vm_id: Uuid) -> StoreResult<Vec<VmTransition>> {
        Ok(sqlx::query_as::<_, VmTransition>(
            "SELECT id, vm_id, from_status, to_status, reason, created_at
             FROM vm_state_history
             WHERE vm_id = $1
             ORDER BY id",
        )
        .bind(vm_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn insert_backup_job(&self, job: NewBackupJob) -> StoreResult<BackupJob> {
        let sql = format!(
            "INSERT INTO backup_jobs (id, vm_id, vm_name, destination_path, compression, status, notes)
             VALUES ($1, $2, $3, $4, $5, 'creating', $6)
             RETURNING {}",
            JOB_COLUMNS
        );
        let vm_name = job.vm_name.clone();
        sqlx::query_as::<_, BackupJob>(&sql)
            .bind(job.id)
            .bind(job.vm_id)
            .bind(&job.vm_name)
            .bind(&job.destination_path)
            .bind(job.compression)
            .bind(&job.notes)
            .fetch_one(&self.db)
            .await
            .map_err(|e| match constraint_of(&e).as_deref() {
                Some("backup_jobs_in_flight_per_vm") => OrchestratorError::JobInProgress(vm_name),
                _ => OrchestratorError::from(e),
            })
    }

    async fn get_backup_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>> {
        let sql = format!("SELECT {} FROM backup_jobs WHERE id = $1", JOB_COLUMNS);
        Ok(sqlx::query_as::<_, BackupJob>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_backup_jobs(&self, vm_id: Option<Uuid>) -> StoreResult<Vec<BackupJob>> {
        let sql = format!(
            "SELECT {} FROM backup_jobs
             WHERE ($1::uuid IS NULL OR vm_id = $1)
             ORDER BY created_at DESC, id DESC",
            JOB_COLUMNS
        );
        Ok(sqlx::query_as::<_, BackupJob>(&sql)
            .bind(vm_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn in_flight_job(&self, vm_id: Uuid) -> StoreResult<Option<BackupJob>> {
        let sql = format!(
            "SELECT {} FROM backup_jobs
             WHERE vm_id = $1 AND status IN ('creating', 'restoring')
             LIMIT 1",
            JOB_COLUMNS
        );
        Ok(sqlx::query_as::<_, BackupJob>(&sql)
            .bind(vm_id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn begin_restore(&self, id: Uuid) -> StoreResult<BackupJob> {
        let sql = format!(
            "UPDATE backup_jobs
             SET status = 'restoring', claimed_at = NULL, error_message = NULL, queued_at = NOW()
             WHERE id = $1 AND status = 'completed'
             RETURNING {}",
            JOB_COLUMNS
        );
        let updated = sqlx::query_as::<_, BackupJob>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await;

        match updated {
            Ok(Some(job)) => Ok(job),
            Ok(None) => match self.get_backup_job(id).await? {
                None => Err(OrchestratorError::job_not_found(id)),
                Some(job) => Err(OrchestratorError::InvalidState(format!(
                    "backup job {} is {}, only completed backups can be restored",
                    id,
                    job.status.as_str()
                ))),
            },
            Err(e) if constraint_of(&e).as_deref() == Some("backup_jobs_in_flight_per_vm") => {
                let vm_name: Option<String> =
                    sqlx::query_scalar("SELECT vm_name FROM backup_jobs WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.db)
                        .await?;
                Err(OrchestratorError::JobInProgress(
                    vm_name.unwrap_or_else(|| id.to_string()),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>> {
        let sql = format!(
            "UPDATE backup_jobs
             SET claimed_at = NOW()
             WHERE id = $1
               AND status IN ('creating', 'restoring')
               AND claimed_at IS NULL
             RETURNING {}",
            JOB_COLUMNS
        );
        Ok(sqlx::query_as::<_, BackupJob>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn complete_job(&self, id: Uuid, size_bytes: Option<i64>) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE backup_jobs
             SET status = 'completed',
                 size_bytes = COALESCE($2, size_bytes),
                 completed_at = NOW()
             WHERE id = $1 AND status IN ('creating', 'restoring')",
        )
        .bind(id)
        .bind(size_bytes)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn fail_job(&self, id: Uuid, note: &str) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE backup_jobs
             SET status = 'failed', error_message = $2, completed_at = NOW()
             WHERE id = $1 AND status IN ('creating', 'restoring')",
        )
        .bind(id)
        .bind(note)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_backup_job(&self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn unclaimed_jobs(&self, queued_before: DateTime<Utc>) -> StoreResult<Vec<BackupJob>> {
        let sql = format!(
            "SELECT {} FROM backup_jobs
             WHERE status IN ('creating', 'restoring')
               AND claimed_at IS NULL
               AND queued_at < $1
             ORDER BY queued_at
             LIMIT 50",
            JOB_COLUMNS
        );
        Ok(sqlx::query_as::<_, BackupJob>(&sql)
            .bind(queued_before)
            .fetch_all(&self.db)
            .await?)
    }

    async fn fail_interrupted_jobs(&self, note: &str) -> StoreResult<u64> {
        let res = sqlx::query(
            "UPDATE backup_jobs
             SET status = 'failed', error_message = $1, completed_at = NOW()
             WHERE status IN ('creating', 'restoring') AND claimed_at IS NOT NULL",
        )
        .bind(note)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }
}
