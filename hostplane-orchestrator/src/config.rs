use hostplane_common::{BackupCompression, DiskFormat, OrchestratorError};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::VNC_BASE_PORT;
use crate::store::PortRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Backup/restore bodies run as tokio tasks in this process.
    Local,
    /// Jobs are announced on the Redis command channel and run by the orchestrator daemon.
    Redis,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub vm_storage_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub run_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub iso_dir: PathBuf,

    /// Hypervisor host implementation: `qemu` or `mock`.
    pub host_kind: String,
    pub qemu_binary: String,
    pub qemu_img_binary: String,

    pub display_port_min: u16,
    pub display_port_max: u16,
    /// Host name written into viewer files.
    pub display_host: String,

    pub stop_grace: Duration,
    pub restart_pause: Duration,

    pub backup_compression: BackupCompression,
    pub job_concurrency: usize,
    pub job_dispatch: DispatchMode,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OrchestratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let dir = |key: &str, default: &str| PathBuf::from(get(key).unwrap_or_else(|| default.to_string()));

        let backup_compression = match get("HOSTPLANE_BACKUP_COMPRESSION") {
            Some(raw) => BackupCompression::parse(&raw).ok_or_else(|| {
                OrchestratorError::InvalidConfiguration(format!(
                    "HOSTPLANE_BACKUP_COMPRESSION: unknown value '{}'",
                    raw
                ))
            })?,
            None => BackupCompression::Gzip,
        };

        let job_dispatch = match get("HOSTPLANE_JOB_DISPATCH").as_deref() {
            None | Some("local") => DispatchMode::Local,
            Some("redis") => DispatchMode::Redis,
            Some(other) => {
                return Err(OrchestratorError::InvalidConfiguration(format!(
                    "HOSTPLANE_JOB_DISPATCH: unknown value '{}'",
                    other
                )))
            }
        };

        let cfg = Self {
            vm_storage_dir: dir("HOSTPLANE_VM_STORAGE_DIR", "/var/lib/hostplane/vms"),
            logs_dir: dir("HOSTPLANE_LOGS_DIR", "/var/lib/hostplane/logs"),
            run_dir: dir("HOSTPLANE_RUN_DIR", "/var/lib/hostplane/run"),
            backup_dir: dir("HOSTPLANE_BACKUP_DIR", "/var/lib/hostplane/backups"),
            iso_dir: dir("HOSTPLANE_ISO_DIR", "/var/lib/hostplane/isos"),
            host_kind: get("HOSTPLANE_HOST").unwrap_or_else(|| "qemu".into()).to_lowercase(),
            qemu_binary: get("HOSTPLANE_QEMU_BINARY").unwrap_or_else(|| "qemu-system-x86_64".into()),
            qemu_img_binary: get("HOSTPLANE_QEMU_IMG_BINARY").unwrap_or_else(|| "qemu-img".into()),
            display_port_min: parse_or(&get, "HOSTPLANE_DISPLAY_PORT_MIN", 5900)?,
            display_port_max: parse_or(&get, "HOSTPLANE_DISPLAY_PORT_MAX", 5999)?,
            display_host: get("HOSTPLANE_DISPLAY_HOST").unwrap_or_else(|| "localhost".into()),
            stop_grace: Duration::from_secs(parse_or(&get, "HOSTPLANE_STOP_GRACE_SECS", 3)?),
            restart_pause: Duration::from_secs(parse_or(&get, "HOSTPLANE_RESTART_PAUSE_SECS", 1)?),
            backup_compression,
            job_concurrency: parse_or(&get, "HOSTPLANE_JOB_CONCURRENCY", 2)?,
            job_dispatch,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Self-contained layout under `base`, no waits. Used by tests and ephemeral runs.
    pub fn under(base: &Path) -> Self {
        Self {
            vm_storage_dir: base.join("vms"),
            logs_dir: base.join("logs"),
            run_dir: base.join("run"),
            backup_dir: base.join("backups"),
            iso_dir: base.join("isos"),
            host_kind: "mock".into(),
            qemu_binary: "qemu-system-x86_64".into(),
            qemu_img_binary: "qemu-img".into(),
            display_port_min: 5900,
            display_port_max: 5999,
            display_host: "localhost".into(),
            stop_grace: Duration::ZERO,
            restart_pause: Duration::ZERO,
            backup_compression: BackupCompression::Gzip,
            job_concurrency: 2,
            job_dispatch: DispatchMode::Local,
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.display_port_min > self.display_port_max {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "display port range {}-{} is empty",
                self.display_port_min, self.display_port_max
            )));
        }
        // VNC addresses displays relative to 5900.
        if self.display_port_min < VNC_BASE_PORT {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "HOSTPLANE_DISPLAY_PORT_MIN must be at least {}",
                VNC_BASE_PORT
            )));
        }
        if self.job_concurrency == 0 {
            return Err(OrchestratorError::InvalidConfiguration(
                "HOSTPLANE_JOB_CONCURRENCY must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn port_range(&self) -> PortRange {
        PortRange {
            min: self.display_port_min,
            max: self.display_port_max,
        }
    }

    pub fn disk_path(&self, vm_name: &str, format: DiskFormat) -> PathBuf {
        self.vm_storage_dir
            .join(format!("{}.{}", vm_name, format.extension()))
    }

    pub fn log_path(&self, vm_name: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.log", vm_name))
    }

    pub fn pid_path(&self, vm_name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", vm_name))
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, OrchestratorError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            OrchestratorError::InvalidConfiguration(format!("{}: cannot parse '{}'", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.vm_storage_dir, PathBuf::from("/var/lib/hostplane/vms"));
        assert_eq!(cfg.port_range(), PortRange { min: 5900, max: 5999 });
        assert_eq!(cfg.stop_grace, Duration::from_secs(3));
        assert_eq!(cfg.backup_compression, BackupCompression::Gzip);
        assert_eq!(cfg.job_dispatch, DispatchMode::Local);
        assert_eq!(cfg.qemu_binary, "qemu-system-x86_64");
        assert_eq!(cfg.host_kind, "qemu");
    }

    #[test]
    fn overrides_and_paths() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("HOSTPLANE_VM_STORAGE_DIR", "/srv/vms"),
            ("HOSTPLANE_LOGS_DIR", "/srv/logs"),
            ("HOSTPLANE_DISPLAY_PORT_MIN", "6000"),
            ("HOSTPLANE_DISPLAY_PORT_MAX", "6002"),
            ("HOSTPLANE_BACKUP_COMPRESSION", "none"),
            ("HOSTPLANE_JOB_DISPATCH", "redis"),
        ]))
        .unwrap();
        assert_eq!(cfg.port_range(), PortRange { min: 6000, max: 6002 });
        assert_eq!(cfg.backup_compression, BackupCompression::None);
        assert_eq!(cfg.job_dispatch, DispatchMode::Redis);
        assert_eq!(
            cfg.disk_path("t1", DiskFormat::Raw),
            PathBuf::from("/srv/vms/t1.img")
        );
        assert_eq!(cfg.log_path("t1"), PathBuf::from("/srv/logs/t1.log"));
    }

    #[test]
    fn rejects_bad_values() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("HOSTPLANE_STOP_GRACE_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");

        let err = OrchestratorConfig::from_lookup(lookup(&[
            ("HOSTPLANE_DISPLAY_PORT_MIN", "5910"),
            ("HOSTPLANE_DISPLAY_PORT_MAX", "5900"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("empty"));

        assert!(OrchestratorConfig::from_lookup(lookup(&[("HOSTPLANE_JOB_DISPATCH", "kafka")])).is_err());

        let err = OrchestratorConfig::from_lookup(lookup(&[
            ("HOSTPLANE_DISPLAY_PORT_MIN", "5800"),
            ("HOSTPLANE_DISPLAY_PORT_MAX", "5899"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("at least 5900"));
    }
}
