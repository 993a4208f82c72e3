//! Disk-image backup and restore as asynchronous jobs.
//!
//! The request path only inserts/updates the `backup_jobs` row and dispatches a
//! command; [`BackupWorker::execute`] does the I/O later and records the outcome
//! on the row. The row is the only hand-off between the two.

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hostplane_common::bus::JobCommand;
use hostplane_common::{
    BackupCompression, BackupJob, BackupStatus, OrchestratorError, VirtualMachine,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dispatch::JobDispatcher;
use crate::store::{NewBackupJob, VmStore};

/// Upper bound on the failure note stored on a job row.
pub const MAX_NOTE_CHARS: usize = 500;

/// `<backup_dir>/<vm>-<YYYYmmddHHMMSS>-<job8>.<ext>[.gz]`
pub fn backup_path(
    config: &OrchestratorConfig,
    vm: &VirtualMachine,
    job_id: Uuid,
    at: DateTime<Utc>,
    compression: BackupCompression,
) -> PathBuf {
    let short: String = job_id.simple().to_string().chars().take(8).collect();
    let mut name = format!(
        "{}-{}-{}.{}",
        vm.name,
        at.format("%Y%m%d%H%M%S"),
        short,
        vm.disk_format.extension()
    );
    if compression == BackupCompression::Gzip {
        name.push_str(".gz");
    }
    config.backup_dir.join(name)
}

pub fn truncate_note(note: &str) -> String {
    if note.chars().count() <= MAX_NOTE_CHARS {
        return note.to_string();
    }
    let mut out: String = note.chars().take(MAX_NOTE_CHARS - 3).collect();
    out.push_str("...");
    out
}

/// Request-side half: validates, persists and dispatches. Never touches image data.
#[derive(Clone)]
pub struct BackupOrchestrator {
    store: Arc<dyn VmStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: Arc<OrchestratorConfig>,
}

impl BackupOrchestrator {
    pub fn new(
        store: Arc<dyn VmStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    async fn load_job(&self, job_id: Uuid) -> Result<BackupJob, OrchestratorError> {
        self.store
            .get_backup_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))
    }

    /// Insert a `creating` job and hand it to a worker. Returns immediately.
    pub async fn create_backup(
        &self,
        vm: &VirtualMachine,
        notes: Option<String>,
    ) -> Result<BackupJob, OrchestratorError> {
        if vm.disk_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "VM {} has no disk image to back up",
                vm.name
            )));
        }
        if vm.is_running() {
            warn!(vm_id = %vm.id, "backing up a running VM: the copy is only crash-consistent");
        }

        let job_id = Uuid::new_v4();
        let compression = self.config.backup_compression;
        let destination = backup_path(&self.config, vm, job_id, Utc::now(), compression);
        let job = self
            .store
            .insert_backup_job(NewBackupJob {
                id: job_id,
                vm_id: vm.id,
                vm_name: vm.name.clone(),
                destination_path: destination.to_string_lossy().into_owned(),
                compression,
                notes: notes.filter(|n| !n.trim().is_empty()),
            })
            .await?;

        info!(job_id = %job.id, vm_id = %vm.id, dest = %job.destination_path, "backup job created");
        self.dispatch(JobCommand::backup(job.id)).await;
        Ok(job)
    }

    /// Pure read; never waits on the worker.
    pub async fn check_backup_status(&self, job_id: Uuid) -> Result<BackupStatus, OrchestratorError> {
        Ok(self.load_job(job_id).await?.status)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<BackupJob, OrchestratorError> {
        self.load_job(job_id).await
    }

    pub async fn list_backups(&self, vm_id: Option<Uuid>) -> Result<Vec<BackupJob>, OrchestratorError> {
        self.store.list_backup_jobs(vm_id).await
    }

    /// `vm` must be the owning VM, already reconciled by the caller.
    pub async fn restore_backup(
        &self,
        job: &BackupJob,
        vm: &VirtualMachine,
    ) -> Result<BackupJob, OrchestratorError> {
        if job.status != BackupStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "backup job {} is {}, only completed backups can be restored",
                job.id,
                job.status.as_str()
            )));
        }
        if vm.is_running() {
            return Err(OrchestratorError::InvalidState(format!(
                "VM {} must be stopped before restoring",
                vm.name
            )));
        }
        if vm.disk_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "VM {} has no disk image to restore into",
                vm.name
            )));
        }

        let job = self.store.begin_restore(job.id).await?;
        info!(job_id = %job.id, vm_id = %vm.id, "restore queued");
        self.dispatch(JobCommand::restore(job.id)).await;
        Ok(job)
    }

    pub async fn delete_backup(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self.load_job(job_id).await?;
        if job.status.is_in_flight() {
            return Err(OrchestratorError::JobInProgress(job.vm_name));
        }
        match tokio::fs::remove_file(&job.destination_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_backup_job(job_id).await?;
        info!(job_id = %job_id, "backup deleted");
        Ok(())
    }

    async fn dispatch(&self, cmd: JobCommand) {
        // A lost dispatch is not fatal: the requeue loop picks up unclaimed rows.
        if let Err(e) = self.dispatcher.dispatch(cmd.clone()).await {
            warn!(job_id = %cmd.job_id, error = %format!("{:#}", e), "job dispatch failed, left for requeue");
        }
    }
}

/// Worker-side half: claims a job row, performs the copy, records the outcome.
pub struct BackupWorker {
    store: Arc<dyn VmStore>,
}

impl BackupWorker {
    pub fn new(store: Arc<dyn VmStore>) -> Self {
        Self { store }
    }

    /// Runs one job to completion or failure. Never returns an error: every
    /// failure is recorded on the job row.
    pub async fn execute(&self, job_id: Uuid) {
        let job = match self.store.claim_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                info!(%job_id, "job already claimed or no longer in flight, skipping");
                return;
            }
            Err(e) => {
                error!(%job_id, error = %e, "failed to claim job");
                return;
            }
        };

        let started = std::time::Instant::now();
        let outcome = match job.status {
            BackupStatus::Creating => self.run_backup(&job).await.map(Some),
            BackupStatus::Restoring => self.run_restore(&job).await.map(|_| None),
            other => Err(anyhow!("job is {}, nothing to do", other.as_str())),
        };

        let recorded = match &outcome {
            Ok(size) => self.store.complete_job(job.id, *size).await,
            Err(e) => self.store.fail_job(job.id, &truncate_note(&format!("{:#}", e))).await,
        };
        if let Err(e) = recorded {
            error!(job_id = %job.id, error = %e, "failed to record job outcome");
        }

        match outcome {
            Ok(size) => info!(
                job_id = %job.id,
                kind = job.status.as_str(),
                size_bytes = ?size,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job completed"
            ),
            Err(e) => warn!(job_id = %job.id, kind = job.status.as_str(), error = %format!("{:#}", e), "job failed"),
        }
    }

    async fn vm_disk(&self, job: &BackupJob) -> anyhow::Result<(VirtualMachine, PathBuf)> {
        let vm = self
            .store
            .get_vm(job.vm_id)
            .await?
            .ok_or_else(|| anyhow!("VM {} no longer exists", job.vm_name))?;
        let disk = vm
            .disk_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("VM {} has no disk image", vm.name))?;
        Ok((vm, disk))
    }

    async fn run_backup(&self, job: &BackupJob) -> anyhow::Result<i64> {
        let (_, source) = self.vm_disk(job).await?;
        let dest = PathBuf::from(&job.destination_path);
        let compression = job.compression;
        let size = tokio::task::spawn_blocking(move || write_backup(&source, &dest, compression))
            .await
            .context("backup task panicked")??;
        i64::try_from(size).context("backup size overflows i64")
    }

    async fn run_restore(&self, job: &BackupJob) -> anyhow::Result<()> {
        let (vm, target) = self.vm_disk(job).await?;
        if vm.is_running() {
            bail!("VM {} was started before the restore ran", vm.name);
        }
        let source = PathBuf::from(&job.destination_path);
        let compression = job.compression;
        tokio::task::spawn_blocking(move || restore_image(&source, &target, compression))
            .await
            .context("restore task panicked")?
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Copy (and optionally gzip) `source` to `dest` via a `.partial` file. Returns the final size.
fn write_backup(source: &Path, dest: &Path, compression: BackupCompression) -> anyhow::Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let partial = sibling(dest, ".partial");
    let result = (|| -> anyhow::Result<()> {
        let mut input = BufReader::new(
            File::open(source).with_context(|| format!("failed to open {}", source.display()))?,
        );
        let out = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        match compression {
            BackupCompression::Gzip => {
                let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
                std::io::copy(&mut input, &mut encoder).context("failed to compress disk image")?;
                let mut writer = encoder.finish().context("failed to finish gzip stream")?;
                writer.flush()?;
                writer.get_ref().sync_all()?;
            }
            BackupCompression::None => {
                let mut writer = BufWriter::new(out);
                std::io::copy(&mut input, &mut writer).context("failed to copy disk image")?;
                writer.flush()?;
                writer.get_ref().sync_all()?;
            }
        }
        std::fs::rename(&partial, dest)
            .with_context(|| format!("failed to move backup into {}", dest.display()))?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    Ok(std::fs::metadata(dest)?.len())
}

/// Write `source` (decompressing if needed) over `target` through a temporary
/// sibling and a rename, so a failed restore leaves the old image intact.
fn restore_image(source: &Path, target: &Path, compression: BackupCompression) -> anyhow::Result<()> {
    let tmp = sibling(target, ".restoring");
    let result = (|| -> anyhow::Result<()> {
        let input = File::open(source)
            .with_context(|| format!("backup file {} is missing", source.display()))?;
        let out = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        let mut writer = BufWriter::new(out);
        match compression {
            BackupCompression::Gzip => {
                let mut decoder = GzDecoder::new(BufReader::new(input));
                std::io::copy(&mut decoder, &mut writer).context("failed to decompress backup")?;
            }
            BackupCompression::None => {
                std::io::copy(&mut BufReader::new(input), &mut writer).context("failed to copy backup")?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        std::fs::rename(&tmp, target)
            .with_context(|| format!("failed to replace {}", target.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn note_truncation() {
        assert_eq!(truncate_note("short"), "short");
        let long = "é".repeat(800);
        let t = truncate_note(&long);
        assert_eq!(t.chars().count(), MAX_NOTE_CHARS);
        assert!(t.ends_with("..."));
    }

    #[test]
    fn gzip_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("t1.qcow2");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&image, &payload).unwrap();

        let dest = dir.path().join("backups/t1.qcow2.gz");
        let size = write_backup(&image, &dest, BackupCompression::Gzip).unwrap();
        assert!(size > 0 && size < payload.len() as u64);
        assert!(!sibling(&dest, ".partial").exists());

        std::fs::write(&image, b"clobbered").unwrap();
        restore_image(&dest, &image, BackupCompression::Gzip).unwrap();
        assert_eq!(std::fs::read(&image).unwrap(), payload);
    }

    #[test]
    fn failed_restore_keeps_old_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("t1.raw");
        std::fs::write(&image, b"original").unwrap();

        // Not gzip data.
        let bogus = dir.path().join("bogus.gz");
        std::fs::write(&bogus, b"definitely not gzip").unwrap();
        assert!(restore_image(&bogus, &image, BackupCompression::Gzip).is_err());
        assert_eq!(std::fs::read(&image).unwrap(), b"original");
        assert!(!sibling(&image, ".restoring").exists());
    }

    #[test]
    fn backup_file_naming() {
        let base = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig::under(base.path());
        let vm: VirtualMachine = serde_json::from_value(serde_json::json!({
            "id": Uuid::nil(), "name": "t1", "uuid": Uuid::nil(), "mac_address": "52:54:00:00:00:01",
            "cpu_cores": 1, "ram_mb": 512, "disk_path": "/x/t1.img", "disk_size_gb": 1,
            "disk_format": "raw", "disk_provisioned": true, "physical_disk": null,
            "boot_order": "c", "iso_path": null, "boot_from_disk": false,
            "network_mode": "nat", "bridge_name": null, "display_protocol": "none",
            "display_port": null, "status": "stopped", "pid": null, "last_started_at": null,
            "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let job = Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();

        let p = backup_path(&cfg, &vm, job, at, BackupCompression::Gzip);
        assert_eq!(p, cfg.backup_dir.join("t1-20260304050607-a1b2c3d4.img.gz"));
        let p = backup_path(&cfg, &vm, job, at, BackupCompression::None);
        assert_eq!(p.file_name().unwrap(), "t1-20260304050607-a1b2c3d4.img");
    }
}
