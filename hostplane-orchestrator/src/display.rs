use hostplane_common::{DisplayProtocol, OrchestratorError, VirtualMachine};

pub const VIEWER_MIME: &str = "application/x-virt-viewer";

/// A remote-viewer connection document, generated on demand and never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewerFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

pub fn viewer_file(vm: &VirtualMachine, host: &str) -> Result<ViewerFile, OrchestratorError> {
    if vm.display_protocol != DisplayProtocol::Spice {
        return Err(OrchestratorError::UnsupportedDisplay(vm.name.clone()));
    }
    let port = vm.display_port().ok_or_else(|| {
        OrchestratorError::InvalidConfiguration(format!(
            "VM {} has no allocated display port",
            vm.name
        ))
    })?;

    let body = format!(
        "[virt-viewer]\n\
         type=spice\n\
         host={host}\n\
         port={port}\n\
         password={password}\n\
         title={title}\n\
         delete-this-file=1\n\
         fullscreen=0\n",
        host = host,
        port = port,
        password = vm.display_secret,
        title = vm.name,
    );

    Ok(ViewerFile {
        file_name: format!("{}.vv", vm.name),
        content_type: VIEWER_MIME,
        body: body.into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hostplane_common::{DiskFormat, NetworkMode, VmStatus};
    use uuid::Uuid;

    fn vm(protocol: DisplayProtocol) -> VirtualMachine {
        VirtualMachine {
            id: Uuid::new_v4(),
            name: "t1".into(),
            uuid: Uuid::new_v4(),
            mac_address: "52:54:00:00:00:01".into(),
            cpu_cores: 1,
            ram_mb: 512,
            disk_path: None,
            disk_size_gb: None,
            disk_format: DiskFormat::Qcow2,
            disk_provisioned: false,
            physical_disk: None,
            boot_order: "cd".into(),
            iso_path: None,
            boot_from_disk: false,
            network_mode: NetworkMode::Nat,
            bridge_name: None,
            display_protocol: protocol,
            display_port: Some(5903),
            display_secret: "Zk3p".into(),
            status: VmStatus::Running,
            pid: Some(1),
            last_started_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn spice_descriptor() {
        let f = viewer_file(&vm(DisplayProtocol::Spice), "hv01.lan").unwrap();
        assert_eq!(f.content_type, "application/x-virt-viewer");
        assert_eq!(f.file_name, "t1.vv");
        let text = String::from_utf8(f.body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "[virt-viewer]",
                "type=spice",
                "host=hv01.lan",
                "port=5903",
                "password=Zk3p",
                "title=t1",
                "delete-this-file=1",
                "fullscreen=0",
            ]
        );
    }

    #[test]
    fn other_protocols_are_unsupported() {
        for p in [DisplayProtocol::Vnc, DisplayProtocol::None] {
            let err = viewer_file(&vm(p), "h").unwrap_err();
            assert_eq!(err.code(), "UNSUPPORTED_DISPLAY");
        }
    }
}
