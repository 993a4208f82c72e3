//! VM record -> hypervisor argument vector. No I/O.

use hostplane_common::{DisplayProtocol, NetworkMode, OrchestratorError, VirtualMachine};
use std::path::Path;

/// Base of the VNC display-number space (`:0` listens on 5900).
pub const VNC_BASE_PORT: u16 = 5900;

/// Build the argument list for launching `vm`, daemonized with its pid written to `pid_file`.
///
/// A daemonized QEMU points its stdio at /dev/null, so both its own diagnostics
/// (`-D`) and the guest serial console are routed to `log_file` explicitly.
pub fn build_args(
    vm: &VirtualMachine,
    pid_file: &Path,
    log_file: &Path,
) -> Result<Vec<String>, OrchestratorError> {
    let mut args: Vec<String> = Vec::with_capacity(40);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-enable-kvm", "-cpu", "host"]);
    push(&["-smp", &vm.cpu_cores.to_string()]);
    push(&["-m", &vm.ram_mb.to_string()]);
    push(&["-machine", "q35,accel=kvm"]);
    push(&["-uuid", &vm.uuid.to_string()]);
    push(&["-name", &vm.name]);

    // Storage
    if let Some(image) = non_empty(&vm.disk_path) {
        push(&[
            "-drive",
            &format!("file={},if=virtio,format={}", image, vm.disk_format.as_str()),
        ]);
    }
    if vm.boot_from_disk {
        if let Some(device) = non_empty(&vm.physical_disk) {
            push(&["-drive", &format!("file={},if=virtio,format=raw", device)]);
        }
    }
    if let Some(iso) = non_empty(&vm.iso_path) {
        push(&["-cdrom", iso]);
    }
    if !vm.boot_order.trim().is_empty() {
        push(&["-boot", &format!("order={}", vm.boot_order.trim())]);
    }

    // Network
    let nic = format!("virtio-net-pci,netdev=net0,mac={}", vm.mac_address);
    match vm.network_mode {
        NetworkMode::Nat | NetworkMode::User => {
            push(&["-netdev", "user,id=net0", "-device", &nic]);
        }
        NetworkMode::Bridged => {
            let bridge = non_empty(&vm.bridge_name).ok_or_else(|| {
                OrchestratorError::InvalidConfiguration(format!(
                    "VM {} uses bridged networking but has no bridge name",
                    vm.name
                ))
            })?;
            push(&["-netdev", &format!("bridge,id=net0,br={}", bridge), "-device", &nic]);
        }
        NetworkMode::None => push(&["-nic", "none"]),
    }

    // Display
    match vm.display_protocol {
        DisplayProtocol::Spice => {
            let port = allocated_port(vm)?;
            push(&[
                "-spice",
                &format!("port={},addr=0.0.0.0,disable-ticketing=on", port),
                "-device",
                "virtio-vga",
                "-device",
                "virtio-serial-pci",
                "-chardev",
                "spicevmc,id=vdagent,name=vdagent",
                "-device",
                "virtserialport,chardev=vdagent,name=com.redhat.spice.0",
            ]);
        }
        DisplayProtocol::Vnc => {
            let port = allocated_port(vm)?;
            let display = port.checked_sub(VNC_BASE_PORT).ok_or_else(|| {
                OrchestratorError::InvalidConfiguration(format!(
                    "VM {} has VNC port {} below {}",
                    vm.name, port, VNC_BASE_PORT
                ))
            })?;
            push(&["-vnc", &format!(":{}", display)]);
        }
        DisplayProtocol::None => push(&["-display", "none"]),
    }

    // Log capture
    let log = log_file.to_string_lossy();
    push(&["-D", &log]);
    push(&[
        "-chardev",
        &format!("null,id=console0,logfile={},logappend=on", log),
        "-serial",
        "chardev:console0",
    ]);

    push(&["-daemonize", "-pidfile", &pid_file.to_string_lossy()]);
    Ok(args)
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn allocated_port(vm: &VirtualMachine) -> Result<u16, OrchestratorError> {
    vm.display_port().ok_or_else(|| {
        OrchestratorError::InvalidConfiguration(format!(
            "VM {} has no allocated display port",
            vm.name
        ))
    })
}
