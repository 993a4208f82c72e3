use crate::{inventory, HypervisorHost, LaunchSpec, StopSignal};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// In-process stand-in for the hypervisor toolchain.
///
/// Processes are just pids in a set; disk images are small placeholder files so
/// the provisioning/cleanup paths still touch the filesystem.
pub struct MockHost {
    next_pid: AtomicU32,
    live: Mutex<HashSet<u32>>,
    launches: Mutex<Vec<LaunchSpec>>,
    signals: Mutex<Vec<(u32, StopSignal)>>,
    images: Mutex<Vec<(PathBuf, u64, String)>>,
    fail_launch: AtomicBool,
    fail_disk_create: AtomicBool,
    /// When false, SIGTERM is delivered but ignored (guest refuses to shut down).
    honor_terminate: AtomicBool,
    disks: Mutex<Vec<inventory::PhysicalDisk>>,
    bridges: Mutex<Vec<inventory::NetworkBridge>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(41000),
            live: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
            fail_disk_create: AtomicBool::new(false),
            honor_terminate: AtomicBool::new(true),
            disks: Mutex::new(Vec::new()),
            bridges: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disk_create(&self, fail: bool) {
        self.fail_disk_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_honor_terminate(&self, honor: bool) {
        self.honor_terminate.store(honor, Ordering::SeqCst);
    }

    pub fn set_physical_disks(&self, disks: Vec<inventory::PhysicalDisk>) {
        *lock(&self.disks) = disks;
    }

    pub fn set_network_bridges(&self, names: &[&str]) {
        *lock(&self.bridges) = names
            .iter()
            .map(|n| inventory::NetworkBridge {
                name: n.to_string(),
            })
            .collect();
    }

    /// Simulate the guest dying without going through the orchestrator.
    pub fn kill_out_of_band(&self, pid: u32) {
        lock(&self.live).remove(&pid);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        lock(&self.launches).clone()
    }

    pub fn last_launch(&self) -> Option<LaunchSpec> {
        lock(&self.launches).last().cloned()
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        lock(&self.signals).clone()
    }

    pub fn created_images(&self) -> Vec<(PathBuf, u64, String)> {
        lock(&self.images).clone()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl HypervisorHost for MockHost {
    async fn create_disk_image(&self, path: &Path, size_gb: u64, format: &str) -> Result<()> {
        if self.fail_disk_create.load(Ordering::SeqCst) {
            bail!("mock: disk image creation disabled");
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, format!("mock {} image, {}G\n", format, size_gb)).await?;
        lock(&self.images).push((path.to_path_buf(), size_gb, format.to_string()));
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        lock(&self.launches).push(spec.clone());
        if let Some(parent) = spec.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.fail_launch.load(Ordering::SeqCst) {
            tokio::fs::write(&spec.log_path, "mock: could not initialize accelerator\n").await?;
            bail!("{} exited with status 1: mock launch failure", spec.binary);
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        lock(&self.live).insert(pid);
        tokio::fs::write(&spec.log_path, format!("mock guest started, pid {}\n", pid)).await?;
        if let Some(parent) = spec.pid_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&spec.pid_file, format!("{}\n", pid)).await?;
        Ok(pid)
    }

    async fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool> {
        lock(&self.signals).push((pid, signal));
        let mut live = lock(&self.live);
        if !live.contains(&pid) {
            return Ok(false);
        }
        let dies = match signal {
            StopSignal::Kill => true,
            StopSignal::Terminate => self.honor_terminate.load(Ordering::SeqCst),
        };
        if dies {
            live.remove(&pid);
        }
        Ok(true)
    }

    async fn is_alive(&self, pid: u32) -> bool {
        lock(&self.live).contains(&pid)
    }

    async fn list_physical_disks(&self) -> Result<Vec<inventory::PhysicalDisk>> {
        Ok(lock(&self.disks).clone())
    }

    async fn list_network_bridges(&self) -> Result<Vec<inventory::NetworkBridge>> {
        Ok(lock(&self.bridges).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path) -> LaunchSpec {
        LaunchSpec {
            binary: "qemu-system-x86_64".into(),
            args: vec!["-daemonize".into()],
            log_path: dir.join("logs/t1.log"),
            pid_file: dir.join("run/t1.pid"),
        }
    }

    #[tokio::test]
    async fn launch_then_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new();
        let pid = host.launch(&spec(dir.path())).await.unwrap();
        assert!(host.is_alive(pid).await);
        assert!(dir.path().join("run/t1.pid").exists());

        assert!(host.signal(pid, StopSignal::Terminate).await.unwrap());
        assert!(!host.is_alive(pid).await);
        // Already gone.
        assert!(!host.signal(pid, StopSignal::Kill).await.unwrap());
    }

    #[tokio::test]
    async fn stubborn_guest_needs_kill() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new();
        host.set_honor_terminate(false);
        let pid = host.launch(&spec(dir.path())).await.unwrap();
        host.signal(pid, StopSignal::Terminate).await.unwrap();
        assert!(host.is_alive(pid).await);
        host.signal(pid, StopSignal::Kill).await.unwrap();
        assert!(!host.is_alive(pid).await);
    }

    #[tokio::test]
    async fn failed_launch_leaves_no_process() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new();
        host.set_fail_launch(true);
        assert!(host.launch(&spec(dir.path())).await.is_err());
        assert_eq!(host.live_count(), 0);
        assert_eq!(host.launches().len(), 1);
    }
}
