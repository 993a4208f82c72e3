use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A fully-resolved hypervisor invocation.
///
/// `args` are expected to make the hypervisor daemonize and write its pid to
/// `pid_file`; the host only waits for that file to appear.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub pid_file: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful (SIGTERM).
    Terminate,
    /// Forced (SIGKILL).
    Kill,
}

#[async_trait]
pub trait HypervisorHost: Send + Sync {
    /// Create a sparse disk image of `size_gb` in the given format (qcow2, raw, vmdk, vdi).
    async fn create_disk_image(&self, path: &Path, size_gb: u64, format: &str) -> Result<()>;

    /// Launch a detached hypervisor process and return its pid.
    async fn launch(&self, spec: &LaunchSpec) -> Result<u32>;

    /// Deliver a signal. Returns false if the process no longer exists.
    async fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool>;

    async fn is_alive(&self, pid: u32) -> bool;

    // Optional: host inventory. Hosts without block-device / bridge discovery report nothing.
    async fn list_physical_disks(&self) -> Result<Vec<inventory::PhysicalDisk>> {
        Ok(vec![])
    }

    async fn list_network_bridges(&self) -> Result<Vec<inventory::NetworkBridge>> {
        Ok(vec![])
    }
}

/// Host inventory records, shared with the API through `hostplane-common`.
pub mod inventory {
    pub use hostplane_common::{NetworkBridge, PhysicalDisk};
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "qemu")]
pub mod qemu;
