use hostplane_common::{DiskFormat, OrchestratorError};
use hostplane_host::HypervisorHost;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates and removes VM backing images through the host's disk-image tool.
#[derive(Clone)]
pub struct DiskProvisioner {
    host: Arc<dyn HypervisorHost>,
}

impl DiskProvisioner {
    pub fn new(host: Arc<dyn HypervisorHost>) -> Self {
        Self { host }
    }

    /// Never overwrites: an existing file at `path` is a provisioning failure.
    pub async fn create_disk_image(
        &self,
        path: &Path,
        size_gb: u32,
        format: DiskFormat,
    ) -> Result<(), OrchestratorError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(OrchestratorError::ProvisioningFailed(format!(
                "{} already exists",
                path.display()
            )));
        }
        self.host
            .create_disk_image(path, u64::from(size_gb), format.as_str())
            .await
            .map_err(|e| OrchestratorError::ProvisioningFailed(format!("{:#}", e)))?;
        info!(path = %path.display(), size_gb, format = format.as_str(), "disk image created");
        Ok(())
    }

    /// Missing file is not an error.
    pub async fn delete_disk_image(&self, path: &Path) -> Result<(), OrchestratorError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "disk image removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove disk image");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostplane_host::mock::MockHost;

    #[tokio::test]
    async fn create_refuses_to_overwrite_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(MockHost::new());
        let disks = DiskProvisioner::new(host.clone());
        let path = dir.path().join("vms/t1.qcow2");

        disks.create_disk_image(&path, 10, DiskFormat::Qcow2).await.unwrap();
        assert!(path.exists());
        assert_eq!(host.created_images()[0].1, 10);

        let err = disks
            .create_disk_image(&path, 10, DiskFormat::Qcow2)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROVISIONING_FAILED");

        disks.delete_disk_image(&path).await.unwrap();
        assert!(!path.exists());
        disks.delete_disk_image(&path).await.unwrap();
    }

    #[tokio::test]
    async fn tool_failure_is_provisioning_failed() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(MockHost::new());
        host.set_fail_disk_create(true);
        let err = DiskProvisioner::new(host)
            .create_disk_image(&dir.path().join("x.raw"), 1, DiskFormat::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProvisioningFailed(_)));
    }
}
