use hostplane_host::HypervisorHost;
use std::sync::Arc;

use crate::config::OrchestratorConfig;

pub struct HostManager;

impl HostManager {
    /// Host implementations compiled into this binary.
    pub fn available() -> Vec<&'static str> {
        let mut names = Vec::new();
        #[cfg(feature = "provider-qemu")]
        names.push("qemu");
        #[cfg(feature = "provider-mock")]
        names.push("mock");
        names
    }

    pub fn get_host(config: &OrchestratorConfig) -> Option<Arc<dyn HypervisorHost>> {
        match config.host_kind.to_lowercase().as_str() {
            #[cfg(feature = "provider-qemu")]
            "qemu" => Some(Arc::new(hostplane_host::qemu::QemuHost::new(
                config.qemu_img_binary.clone(),
            ))),
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(hostplane_host::mock::MockHost::new())),
            _ => None,
        }
    }
}
