mod common;

use common::{harness, headless_spec, spec};
use hostplane_common::{DisplayProtocol, OrchestratorError, PhysicalDisk, VmSpecPatch, VmStatus};
use hostplane_host::StopSignal;
use hostplane_orchestrator::store::VmStore;
use std::path::PathBuf;

fn assert_pid_matches_status(vms: &[hostplane_common::VirtualMachine]) {
    for vm in vms {
        assert_eq!(
            vm.status == VmStatus::Running,
            vm.pid.is_some(),
            "VM {} is {} with pid {:?}",
            vm.name,
            vm.status.as_str(),
            vm.pid
        );
    }
}

#[tokio::test]
async fn test_out_of_band_exit_is_reconciled_to_stopped() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    assert_eq!(vm.status, VmStatus::Stopped);
    assert!(vm.pid.is_none());

    let vm = h.orchestrator.start(vm.id).await.unwrap();
    let status = h.orchestrator.reconcile(vm.id).await.unwrap();
    assert_eq!(status.status, VmStatus::Running);
    let pid = status.pid.expect("running VM has a pid");
    assert!(status.last_started_at.is_some());

    h.host.kill_out_of_band(pid as u32);

    // The pure read still reports the persisted belief.
    assert_eq!(h.orchestrator.status(vm.id).await.unwrap().status, VmStatus::Running);

    let status = h.orchestrator.reconcile(vm.id).await.unwrap();
    assert_eq!(status.status, VmStatus::Stopped);
    assert!(status.pid.is_none());
    assert!(!h.config.pid_path("t1").exists());

    let reasons: Vec<String> = h
        .orchestrator
        .transitions(vm.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.reason)
        .collect();
    assert_eq!(reasons, vec!["created", "start", "process exited"]);
}

#[tokio::test]
async fn test_reconcile_writes_nothing_when_belief_matches() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();

    // Stopped VM.
    let before = h.store.write_count();
    h.orchestrator.reconcile(vm.id).await.unwrap();
    assert_eq!(h.store.write_count(), before);

    // Running VM with a live process.
    h.orchestrator.start(vm.id).await.unwrap();
    let before = h.store.write_count();
    h.orchestrator.reconcile(vm.id).await.unwrap();
    assert_eq!(h.store.write_count(), before);

    // Dead process: one correction, then quiet again.
    let pid = h.orchestrator.status(vm.id).await.unwrap().pid.unwrap();
    h.host.kill_out_of_band(pid as u32);
    let first = h.orchestrator.reconcile(vm.id).await.unwrap();
    let after_first = h.store.write_count();
    assert!(after_first > before);
    let second = h.orchestrator.reconcile(vm.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.store.write_count(), after_first);
}

#[tokio::test]
async fn test_stop_on_stopped_vm_is_not_running_and_changes_nothing() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let writes = h.store.write_count();

    for force in [true, false] {
        let err = h.orchestrator.stop(vm.id, force).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotRunning(_)), "{:?}", err);
    }

    let after = h.orchestrator.get_vm(vm.id).await.unwrap();
    assert_eq!(after.status, VmStatus::Stopped);
    assert!(after.pid.is_none());
    assert_eq!(after.updated_at, vm.updated_at);
    assert_eq!(h.store.write_count(), writes);
    assert!(h.host.signals().is_empty());
}

#[tokio::test]
async fn test_graceful_stop_sends_terminate() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let running = h.orchestrator.start(vm.id).await.unwrap();
    let pid = running.pid.unwrap() as u32;
    assert!(h.config.pid_path("t1").exists());

    let stopped = h.orchestrator.stop(vm.id, false).await.unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);
    assert!(stopped.pid.is_none());
    assert_eq!(h.host.signals(), vec![(pid, StopSignal::Terminate)]);
    assert!(!h.config.pid_path("t1").exists());
    assert_eq!(h.host.live_count(), 0);
}

#[tokio::test]
async fn test_force_stop_sends_kill() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let pid = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap() as u32;

    h.orchestrator.stop(vm.id, true).await.unwrap();
    assert_eq!(h.host.signals(), vec![(pid, StopSignal::Kill)]);

    let last = h.orchestrator.transitions(vm.id).await.unwrap().pop().unwrap();
    assert_eq!(last.reason, "force stop");
    assert_eq!(last.from_status.as_deref(), Some("running"));
    assert_eq!(last.to_status, "stopped");
}

#[tokio::test]
async fn test_stop_does_not_wait_for_a_stubborn_guest() {
    let h = harness();
    h.host.set_honor_terminate(false);
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    h.orchestrator.start(vm.id).await.unwrap();

    let stopped = h.orchestrator.stop(vm.id, false).await.unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);
    // The process ignored SIGTERM and is still there; the record no longer tracks it.
    assert_eq!(h.host.live_count(), 1);
}

#[tokio::test]
async fn test_start_twice_is_already_running() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let first = h.orchestrator.start(vm.id).await.unwrap();

    let err = h.orchestrator.start(vm.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(_)));
    assert_eq!(h.host.launches().len(), 1);
    assert_eq!(h.orchestrator.get_vm(vm.id).await.unwrap().pid, first.pid);
}

#[tokio::test]
async fn test_start_after_out_of_band_exit_relaunches() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let first = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap();
    h.host.kill_out_of_band(first as u32);

    let second = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap();
    assert_ne!(first, second);
    assert_eq!(h.host.launches().len(), 2);
}

#[tokio::test]
async fn test_launch_failure_leaves_vm_stopped() {
    let h = harness();
    h.host.set_fail_launch(true);
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();

    let err = h.orchestrator.start(vm.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::LaunchFailed(_)), "{:?}", err);
    assert!(err.to_string().contains("mock launch failure"));

    let after = h.orchestrator.get_vm(vm.id).await.unwrap();
    assert_eq!(after.status, VmStatus::Stopped);
    assert!(after.pid.is_none());
}

#[tokio::test]
async fn test_launch_uses_argument_vector() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    h.orchestrator.start(vm.id).await.unwrap();

    let launch = h.host.last_launch().unwrap();
    assert_eq!(launch.binary, "qemu-system-x86_64");
    assert_eq!(launch.pid_file, h.config.pid_path("t1"));
    assert_eq!(launch.log_path, h.config.log_path("t1"));
    assert!(launch.args.iter().any(|a| a == "-daemonize"));
    assert!(launch.args.iter().any(|a| a.contains(&vm.mac_address)));
    let log = h.config.log_path("t1").to_string_lossy().into_owned();
    assert!(launch.args.windows(2).any(|w| w[0] == "-D" && w[1] == log));
}

#[tokio::test]
async fn test_restart_yields_a_new_process() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let before = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap();

    let after = h.orchestrator.restart(vm.id).await.unwrap();
    assert_eq!(after.status, VmStatus::Running);
    assert_ne!(after.pid.unwrap(), before);

    let reasons: Vec<String> = h
        .orchestrator
        .transitions(vm.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.reason)
        .collect();
    assert_eq!(reasons, vec!["created", "start", "stop", "start"]);
}

#[tokio::test]
async fn test_restart_of_stopped_vm_starts_it() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let after = h.orchestrator.restart(vm.id).await.unwrap();
    assert_eq!(after.status, VmStatus::Running);
    assert!(h.host.signals().is_empty());
}

#[tokio::test]
async fn test_pid_tracks_status_across_operations() {
    let h = harness();
    let a = h.orchestrator.create(spec("a")).await.unwrap();
    let b = h.orchestrator.create(headless_spec("b")).await.unwrap();

    h.orchestrator.start(a.id).await.unwrap();
    assert_pid_matches_status(&h.orchestrator.list_vms().await.unwrap());

    h.orchestrator.start(b.id).await.unwrap();
    h.orchestrator.restart(a.id).await.unwrap();
    assert_pid_matches_status(&h.orchestrator.list_vms().await.unwrap());

    let pid_b = h.orchestrator.get_vm(b.id).await.unwrap().pid.unwrap();
    h.host.kill_out_of_band(pid_b as u32);
    assert_eq!(h.orchestrator.reconcile_all().await.unwrap(), 1);
    assert_pid_matches_status(&h.orchestrator.list_vms().await.unwrap());

    h.orchestrator.stop(a.id, true).await.unwrap();
    let vms = h.orchestrator.list_vms().await.unwrap();
    assert_pid_matches_status(&vms);
    assert!(vms.iter().all(|v| v.status == VmStatus::Stopped));
}

#[tokio::test]
async fn test_create_provisions_disk_and_identity() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();

    let disk = PathBuf::from(vm.disk_path.as_deref().unwrap());
    assert_eq!(disk, h.config.vm_storage_dir.join("t1.qcow2"));
    assert!(disk.exists());
    assert!(vm.disk_provisioned);
    assert_eq!(h.host.created_images(), vec![(disk, 10, "qcow2".to_string())]);

    assert!(vm.mac_address.starts_with("52:54:00:"));
    assert_eq!(vm.display_port, Some(5900));
    assert_eq!(vm.display_secret.len(), 24);

    let history = h.orchestrator.transitions(vm.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].from_status.is_none());
}

#[tokio::test]
async fn test_create_rejects_duplicates_and_bad_specs() {
    let h = harness();
    h.orchestrator.create(spec("t1")).await.unwrap();

    let err = h.orchestrator.create(spec("t1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfiguration(_)));
    assert_eq!(h.host.created_images().len(), 1);

    let mut bridged = spec("t2");
    bridged.network_mode = hostplane_common::NetworkMode::Bridged;
    let err = h.orchestrator.create(bridged).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfiguration(_)));

    let mut zero = spec("t3");
    zero.cpu_cores = 0;
    assert!(h.orchestrator.create(zero).await.is_err());

    assert_eq!(h.orchestrator.list_vms().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disk_failure_leaves_no_record() {
    let h = harness();
    h.host.set_fail_disk_create(true);

    let err = h.orchestrator.create(spec("t1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ProvisioningFailed(_)), "{:?}", err);
    assert!(h.orchestrator.list_vms().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_refuses_to_overwrite_an_existing_image() {
    let h = harness();
    std::fs::create_dir_all(&h.config.vm_storage_dir).unwrap();
    std::fs::write(h.config.vm_storage_dir.join("t1.qcow2"), b"precious").unwrap();

    let err = h.orchestrator.create(spec("t1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ProvisioningFailed(_)));
    assert_eq!(
        std::fs::read(h.config.vm_storage_dir.join("t1.qcow2")).unwrap(),
        b"precious"
    );
}

#[tokio::test]
async fn test_update_requires_a_stopped_vm() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    h.orchestrator.start(vm.id).await.unwrap();

    let patch = VmSpecPatch {
        cpu_cores: Some(4),
        ..Default::default()
    };
    let err = h.orchestrator.update(vm.id, patch.clone()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(_)));

    h.orchestrator.stop(vm.id, false).await.unwrap();
    let updated = h.orchestrator.update(vm.id, patch).await.unwrap();
    assert_eq!(updated.cpu_cores, 4);
    assert_eq!(updated.ram_mb, 1024);
    assert_eq!(updated.display_port, vm.display_port);
}

#[tokio::test]
async fn test_update_clears_optional_fields_with_empty_strings() {
    let h = harness();
    let mut s = spec("t1");
    s.iso_path = Some("/isos/install.iso".into());
    let vm = h.orchestrator.create(s).await.unwrap();
    assert_eq!(vm.iso_path.as_deref(), Some("/isos/install.iso"));

    let updated = h
        .orchestrator
        .update(
            vm.id,
            VmSpecPatch {
                iso_path: Some(String::new()),
                boot_order: Some("c".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.iso_path.is_none());
    assert_eq!(updated.boot_order, "c");
}

#[tokio::test]
async fn test_update_cannot_enable_a_display_without_a_port() {
    let h = harness();
    let vm = h.orchestrator.create(headless_spec("t1")).await.unwrap();
    assert!(vm.display_port.is_none());

    let err = h
        .orchestrator
        .update(
            vm.id,
            VmSpecPatch {
                display_protocol: Some(DisplayProtocol::Spice),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_delete_running_vm_kills_it_and_removes_its_image() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let pid = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap() as u32;
    let disk = PathBuf::from(vm.disk_path.clone().unwrap());

    h.orchestrator.delete(vm.id).await.unwrap();

    assert!(h.host.signals().contains(&(pid, StopSignal::Kill)));
    assert_eq!(h.host.live_count(), 0);
    assert!(!disk.exists());
    let err = h.orchestrator.get_vm(vm.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    // Name and port are free again.
    let again = h.orchestrator.create(spec("t1")).await.unwrap();
    assert_eq!(again.display_port, vm.display_port);
}

#[tokio::test]
async fn test_delete_clears_a_stale_pid_file() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let pid_file = h.config.pid_path("t1");
    std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    std::fs::write(&pid_file, "4242\n").unwrap();

    h.orchestrator.delete(vm.id).await.unwrap();
    assert!(!pid_file.exists());
}

#[tokio::test]
async fn test_mutating_operations_take_the_vm_lease() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let before = h.store.lease_count();

    // Reads and reconciliation go without it.
    h.orchestrator.get_vm(vm.id).await.unwrap();
    h.orchestrator.status(vm.id).await.unwrap();
    h.orchestrator.reconcile(vm.id).await.unwrap();
    assert_eq!(h.store.lease_count(), before);

    h.orchestrator.start(vm.id).await.unwrap();
    h.orchestrator.restart(vm.id).await.unwrap();
    h.orchestrator.stop(vm.id, false).await.unwrap();
    let patch = VmSpecPatch {
        ram_mb: Some(2048),
        ..Default::default()
    };
    h.orchestrator.update(vm.id, patch).await.unwrap();
    h.orchestrator.delete(vm.id).await.unwrap();
    assert_eq!(h.store.lease_count(), before + 5);
}

#[tokio::test]
async fn test_delete_keeps_attached_images() {
    let h = harness();
    let attached = h.dir.path().join("existing.qcow2");
    std::fs::write(&attached, b"data").unwrap();

    let mut s = spec("t1");
    s.disk_size_gb = None;
    s.disk_path = Some(attached.to_string_lossy().into_owned());
    let vm = h.orchestrator.create(s).await.unwrap();
    assert!(!vm.disk_provisioned);
    assert!(h.host.created_images().is_empty());

    h.orchestrator.delete(vm.id).await.unwrap();
    assert!(attached.exists());
}

#[tokio::test]
async fn test_unknown_vm_is_not_found() {
    let h = harness();
    let id = uuid::Uuid::new_v4();
    assert!(matches!(h.orchestrator.start(id).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orchestrator.stop(id, true).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orchestrator.reconcile(id).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orchestrator.delete(id).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orchestrator.logs(id, 10).await, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn test_logs_return_the_tail() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    assert_eq!(h.orchestrator.logs(vm.id, 50).await.unwrap(), "");

    let pid = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap();
    let log = h.orchestrator.logs(vm.id, 50).await.unwrap();
    assert!(log.contains(&format!("pid {}", pid)));

    let mut lines: Vec<String> = (1..=30).map(|i| format!("line {}", i)).collect();
    lines.insert(0, log);
    std::fs::write(h.config.log_path("t1"), lines.join("\n")).unwrap();
    assert_eq!(h.orchestrator.logs(vm.id, 2).await.unwrap(), "line 29\nline 30");
    assert_eq!(h.orchestrator.logs(vm.id, 0).await.unwrap(), "");
}

#[tokio::test]
async fn test_viewer_file_for_spice_only() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let file = h.orchestrator.generate_spice_file(vm.id).await.unwrap();
    assert_eq!(file.file_name, "t1.vv");
    assert_eq!(file.content_type, "application/x-virt-viewer");
    let body = String::from_utf8(file.body).unwrap();
    assert!(body.contains("port=5900"));
    assert!(body.contains(&format!("password={}", vm.display_secret)));

    let headless = h.orchestrator.create(headless_spec("t2")).await.unwrap();
    let err = h.orchestrator.generate_spice_file(headless.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnsupportedDisplay(_)));
}

#[tokio::test]
async fn test_inventory_reflects_the_host() {
    let h = harness();
    h.host.set_network_bridges(&["br0", "virbr0"]);
    std::fs::create_dir_all(&h.config.iso_dir).unwrap();
    std::fs::write(h.config.iso_dir.join("debian.iso"), b"iso").unwrap();
    std::fs::write(h.config.iso_dir.join("notes.txt"), b"txt").unwrap();

    let bridges: Vec<String> = h
        .orchestrator
        .list_network_bridges()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(bridges, vec!["br0", "virbr0"]);

    let isos = h.orchestrator.list_isos().await.unwrap();
    assert_eq!(isos.len(), 1);
    assert_eq!(isos[0].name, "debian.iso");
    assert_eq!(isos[0].size_bytes, 3);

    assert!(h.orchestrator.list_physical_disks().await.unwrap().is_empty());

    // The host reports the same records the API serves.
    let sdb = PhysicalDisk {
        name: "sdb".into(),
        path: "/dev/sdb".into(),
        size_bytes: Some(500_107_862_016),
        model: Some("Samsung SSD 870".into()),
    };
    h.host.set_physical_disks(vec![sdb.clone()]);
    assert_eq!(h.orchestrator.list_physical_disks().await.unwrap(), vec![sdb]);
}

#[tokio::test]
async fn test_mark_stopped_with_stale_pid_is_ignored() {
    let h = harness();
    let vm = h.orchestrator.create(spec("t1")).await.unwrap();
    let pid = h.orchestrator.start(vm.id).await.unwrap().pid.unwrap();

    assert!(!h.store.mark_stopped(vm.id, Some(pid + 1)).await.unwrap());
    assert_eq!(h.orchestrator.status(vm.id).await.unwrap().status, VmStatus::Running);
}
