use hostplane_common::{IsoImage, NetworkBridge, OrchestratorError, PhysicalDisk};
use hostplane_host::HypervisorHost;
use std::path::Path;

/// `*.iso` files directly under `dir`, sorted by name. A missing directory is empty.
pub async fn list_isos(dir: &Path) -> Result<Vec<IsoImage>, OrchestratorError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut isos = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_iso = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("iso"));
        if !is_iso {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        isos.push(IsoImage {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: path.to_string_lossy().into_owned(),
            size_bytes: meta.len(),
        });
    }
    isos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(isos)
}

fn host_failure(what: &str, e: anyhow::Error) -> OrchestratorError {
    OrchestratorError::Io(std::io::Error::other(format!("{}: {:#}", what, e)))
}

pub async fn list_physical_disks(
    host: &dyn HypervisorHost,
) -> Result<Vec<PhysicalDisk>, OrchestratorError> {
    host.list_physical_disks()
        .await
        .map_err(|e| host_failure("listing block devices", e))
}

pub async fn list_network_bridges(
    host: &dyn HypervisorHost,
) -> Result<Vec<NetworkBridge>, OrchestratorError> {
    host.list_network_bridges()
        .await
        .map_err(|e| host_failure("listing network bridges", e))
}
