use crate::{inventory, HypervisorHost, LaunchSpec, StopSignal};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Drives the local QEMU toolchain (`qemu-img`, `qemu-system-*`) plus a few
/// read-only queries of the host (`lsblk`, `/sys/class/net`).
pub struct QemuHost {
    qemu_img_binary: String,
    launch_timeout: Duration,
    sys_class_net: PathBuf,
}

impl QemuHost {
    pub fn new(qemu_img_binary: impl Into<String>) -> Self {
        Self {
            qemu_img_binary: qemu_img_binary.into(),
            launch_timeout: Duration::from_secs(5),
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }
}

#[async_trait]
impl HypervisorHost for QemuHost {
    async fn create_disk_image(&self, path: &Path, size_gb: u64, format: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let output = Command::new(&self.qemu_img_binary)
            .arg("create")
            .arg("-f")
            .arg(format)
            .arg(path)
            .arg(format!("{}G", size_gb))
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.qemu_img_binary))?;

        if !output.status.success() {
            bail!(
                "{} create failed ({}): {}",
                self.qemu_img_binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        // A stale pidfile from a crashed run would be mistaken for the new process.
        if spec.pid_file.exists() {
            let _ = tokio::fs::remove_file(&spec.pid_file).await;
        }
        for dir in [spec.log_path.parent(), spec.pid_file.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .with_context(|| format!("failed to open log {}", spec.log_path.display()))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // Keep the guest out of our process group so a Ctrl-C on the daemon doesn't reach it.
        cmd.process_group(0);

        // With -daemonize the foreground process exits once the guest is set up.
        let status = tokio::time::timeout(self.launch_timeout, cmd.status())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} did not daemonize within {:?}",
                    spec.binary,
                    self.launch_timeout
                )
            })?
            .with_context(|| format!("failed to spawn {}", spec.binary))?;

        if !status.success() {
            bail!(
                "{} exited with {}: {}",
                spec.binary,
                status,
                log_tail(&spec.log_path, 20).await
            );
        }

        wait_for_pid_file(&spec.pid_file, self.launch_timeout).await
    }

    async fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool> {
        let pid = to_pid(pid)?;
        let sig = match signal {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; pid is strictly positive.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(err).with_context(|| format!("kill({}, {}) failed", pid, sig))
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = to_pid(pid) else {
            return false;
        };
        // SAFETY: signal 0 only performs the existence / permission check.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    async fn list_physical_disks(&self) -> Result<Vec<inventory::PhysicalDisk>> {
        let output = Command::new("lsblk")
            .args(["-J", "-b", "-d", "-o", "NAME,PATH,SIZE,TYPE,MODEL"])
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to spawn lsblk")?;
        if !output.status.success() {
            bail!(
                "lsblk failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_lsblk(&output.stdout)
    }

    async fn list_network_bridges(&self) -> Result<Vec<inventory::NetworkBridge>> {
        let mut entries = match tokio::fs::read_dir(&self.sys_class_net).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context("failed to read /sys/class/net"),
        };

        let mut bridges = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // Bridge devices expose a `bridge/` attribute directory.
            if tokio::fs::metadata(entry.path().join("bridge"))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                bridges.push(inventory::NetworkBridge {
                    name: entry.file_name().to_string_lossy().into_owned(),
                });
            }
        }
        bridges.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(bridges)
    }
}

fn to_pid(pid: u32) -> Result<libc::pid_t> {
    // 0 and negative values address process groups; never forward them.
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => bail!("invalid pid {}", pid),
    }
}

async fn wait_for_pid_file(path: &Path, timeout: Duration) -> Result<u32> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(raw) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if pid > 0 {
                    return Ok(pid);
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("pidfile {} did not appear within {:?}", path.display(), timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(raw) = tokio::fs::read_to_string(path).await else {
        return String::new();
    };
    let all: Vec<&str> = raw.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn parse_lsblk(raw: &[u8]) -> Result<Vec<inventory::PhysicalDisk>> {
    let v: serde_json::Value = serde_json::from_slice(raw).context("invalid lsblk JSON")?;
    let devices = v
        .get("blockdevices")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for dev in devices {
        if dev.get("type").and_then(|t| t.as_str()) != Some("disk") {
            continue;
        }
        let Some(name) = dev.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        let path = dev
            .get("path")
            .and_then(|p| p.as_str())
            .map(|p| p.to_string())
            .unwrap_or_else(|| format!("/dev/{}", name));
        // Older util-linux prints sizes as strings even with -b.
        let size_bytes = match dev.get("size") {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        let model = dev
            .get("model")
            .and_then(|m| m.as_str())
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        out.push(inventory::PhysicalDisk {
            name: name.to_string(),
            path,
            size_bytes,
            model,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsblk_keeps_only_whole_disks() {
        let raw = br#"{"blockdevices":[
            {"name":"sda","path":"/dev/sda","size":500107862016,"type":"disk","model":"Samsung SSD 860  "},
            {"name":"sr0","path":"/dev/sr0","size":"1073741312","type":"rom","model":null},
            {"name":"nvme0n1","size":"256060514304","type":"disk","model":null}
        ]}"#;
        let disks = parse_lsblk(raw).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].path, "/dev/sda");
        assert_eq!(disks[0].model.as_deref(), Some("Samsung SSD 860"));
        assert_eq!(disks[1].path, "/dev/nvme0n1");
        assert_eq!(disks[1].size_bytes, Some(256060514304));
    }

    #[tokio::test]
    async fn bridges_are_detected_by_bridge_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("br0/bridge")).unwrap();
        std::fs::create_dir_all(dir.path().join("eth0")).unwrap();
        std::fs::create_dir_all(dir.path().join("virbr1/bridge")).unwrap();

        let mut host = QemuHost::new("qemu-img");
        host.sys_class_net = dir.path().to_path_buf();
        let names: Vec<String> = host
            .list_network_bridges()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["br0".to_string(), "virbr1".to_string()]);
    }

    #[tokio::test]
    async fn pid_zero_is_never_signalled() {
        let host = QemuHost::new("qemu-img");
        assert!(host.signal(0, StopSignal::Kill).await.is_err());
        assert!(!host.is_alive(0).await);
    }

    #[tokio::test]
    async fn own_process_is_alive() {
        let host = QemuHost::new("qemu-img");
        assert!(host.is_alive(std::process::id()).await);
    }

    #[tokio::test]
    async fn pidfile_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_pid_file(&dir.path().join("x.pid"), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not appear"));
    }
}
