// Common test utilities and fixtures
#![allow(dead_code)]

use hostplane_common::{
    BackupJob, DiskFormat, DisplayProtocol, NetworkMode, VmSpec,
};
use hostplane_host::mock::MockHost;
use hostplane_orchestrator::dispatch::LocalDispatcher;
use hostplane_orchestrator::store::MemoryStore;
use hostplane_orchestrator::{assemble, Orchestrator, OrchestratorConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Orchestrator wired to an in-memory store and a mock host, rooted in a tempdir.
pub struct TestHarness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub host: Arc<MockHost>,
    pub local: Arc<LocalDispatcher>,
    pub config: OrchestratorConfig,
    pub dir: TempDir,
}

pub fn harness() -> TestHarness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut OrchestratorConfig)) -> TestHarness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = OrchestratorConfig::under(dir.path());
    tweak(&mut config);

    let store = Arc::new(MemoryStore::new());
    let host = Arc::new(MockHost::new());
    let runtime = assemble(store.clone(), host.clone(), config.clone(), None)
        .expect("assemble orchestrator");

    TestHarness {
        orchestrator: runtime.orchestrator,
        local: runtime.local,
        store,
        host,
        config,
        dir,
    }
}

/// 2 vCPU / 1 GiB / 10 GB qcow2, SPICE display, NAT.
pub fn spec(name: &str) -> VmSpec {
    VmSpec {
        name: name.to_string(),
        cpu_cores: 2,
        ram_mb: 1024,
        disk_size_gb: Some(10),
        disk_path: None,
        disk_format: DiskFormat::Qcow2,
        physical_disk: None,
        boot_order: "cd".to_string(),
        iso_path: None,
        boot_from_disk: false,
        network_mode: NetworkMode::Nat,
        bridge_name: None,
        display_protocol: DisplayProtocol::Spice,
    }
}

pub fn headless_spec(name: &str) -> VmSpec {
    VmSpec {
        display_protocol: DisplayProtocol::None,
        ..spec(name)
    }
}

/// Poll until the job leaves `creating`/`restoring`.
pub async fn wait_for_job(orchestrator: &Orchestrator, job_id: Uuid) -> BackupJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = orchestrator.get_backup(job_id).await.expect("job exists");
        if !job.status.is_in_flight() {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {} still {} after 10s", job_id, job.status.as_str());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
