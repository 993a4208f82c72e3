use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod error;

pub use error::{ApiEnvelope, ApiErrorBody, OrchestratorError};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "vm_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Stopped, // No hypervisor process
    Running, // Hypervisor process launched, pid recorded
    Paused,  // Reserved for external reporting paths
    Error,   // Reserved for external reporting paths
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
            VmStatus::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "disk_format", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        }
    }

    /// File extension used for images of this format (`raw` images are `.img`).
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "img",
            other => other.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qcow2" => Some(DiskFormat::Qcow2),
            "raw" | "img" => Some(DiskFormat::Raw),
            "vmdk" => Some(DiskFormat::Vmdk),
            "vdi" => Some(DiskFormat::Vdi),
            _ => None,
        }
    }
}

impl Default for DiskFormat {
    fn default() -> Self {
        DiskFormat::Qcow2
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "network_mode", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Nat,
    Bridged,
    User,
    None,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Nat => "nat",
            NetworkMode::Bridged => "bridged",
            NetworkMode::User => "user",
            NetworkMode::None => "none",
        }
    }
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Nat
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "display_protocol", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DisplayProtocol {
    Spice, // Remote display, reachable through a viewer file
    Vnc,   // Local framebuffer
    None,
}

impl DisplayProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayProtocol::Spice => "spice",
            DisplayProtocol::Vnc => "vnc",
            DisplayProtocol::None => "none",
        }
    }

    /// Whether a display port must be allocated for this protocol.
    pub fn needs_port(&self) -> bool {
        !matches!(self, DisplayProtocol::None)
    }
}

impl Default for DisplayProtocol {
    fn default() -> Self {
        DisplayProtocol::Spice
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "backup_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Creating,  // Row inserted, copy pending or in flight
    Completed, // Copy finished, size_bytes is meaningful
    Failed,    // error_message holds the captured note
    Restoring, // Backup being written back over the VM image
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Creating => "creating",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Restoring => "restoring",
        }
    }

    /// A job in this state still has a worker (or a pending dispatch) attached.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BackupStatus::Creating | BackupStatus::Restoring)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "backup_compression", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackupCompression {
    None,
    Gzip,
}

impl BackupCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCompression::None => "none",
            BackupCompression::Gzip => "gzip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "false" => Some(BackupCompression::None),
            "gzip" | "gz" => Some(BackupCompression::Gzip),
            _ => None,
        }
    }
}

// --- Entities (SQLx Mapped) ---

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct VirtualMachine {
    pub id: Uuid,
    pub name: String,
    pub uuid: Uuid,
    pub mac_address: String,

    pub cpu_cores: i32,
    pub ram_mb: i32,

    pub disk_path: Option<String>,
    pub disk_size_gb: Option<i32>,
    pub disk_format: DiskFormat,
    /// True when the image at `disk_path` was created by this control plane.
    pub disk_provisioned: bool,
    pub physical_disk: Option<String>,

    pub boot_order: String,
    pub iso_path: Option<String>,
    pub boot_from_disk: bool,

    pub network_mode: NetworkMode,
    pub bridge_name: Option<String>,

    pub display_protocol: DisplayProtocol,
    pub display_port: Option<i32>,
    #[serde(skip)] // Surfaced only through the viewer file
    pub display_secret: String,

    pub status: VmStatus,
    pub pid: Option<i32>,
    pub last_started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VirtualMachine {
    pub fn display_port(&self) -> Option<u16> {
        self.display_port.and_then(|p| u16::try_from(p).ok())
    }

    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct BackupJob {
    pub id: Uuid,
    /// Owning VM. Not a foreign key: jobs outlive the VM for audit.
    pub vm_id: Uuid,
    pub vm_name: String,
    pub destination_path: String,
    pub size_bytes: Option<i64>,
    pub compression: BackupCompression,
    pub status: BackupStatus,
    pub notes: Option<String>,
    pub error_message: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Last time the job was (re)queued for a worker: creation, or the start of a restore.
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct VmTransition {
    pub id: i64,
    pub vm_id: Uuid,
    pub from_status: Option<String>, // None for the creation entry
    pub to_status: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Runtime view of a VM as returned by status / reconcile.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct VmRuntimeStatus {
    pub vm_id: Uuid,
    pub status: VmStatus,
    pub pid: Option<i32>,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl From<&VirtualMachine> for VmRuntimeStatus {
    fn from(vm: &VirtualMachine) -> Self {
        Self {
            vm_id: vm.id,
            status: vm.status,
            pid: vm.pid,
            last_started_at: vm.last_started_at,
        }
    }
}

// --- Host inventory ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, utoipa::ToSchema)]
pub struct IsoImage {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, utoipa::ToSchema)]
pub struct PhysicalDisk {
    pub name: String,
    pub path: String,
    pub size_bytes: Option<u64>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, utoipa::ToSchema)]
pub struct NetworkBridge {
    pub name: String,
}

// --- Requests ---

/// Declarative hardware/storage/boot/network/display spec of a new VM.
#[derive(Debug, Serialize, Deserialize, Clone, utoipa::ToSchema)]
pub struct VmSpec {
    pub name: String,
    pub cpu_cores: i32,
    pub ram_mb: i32,
    /// Size of a new image to provision. Mutually exclusive with `disk_path`.
    #[serde(default)]
    pub disk_size_gb: Option<i32>,
    /// Existing image to attach instead of provisioning one.
    #[serde(default)]
    pub disk_path: Option<String>,
    #[serde(default)]
    pub disk_format: DiskFormat,
    #[serde(default)]
    pub physical_disk: Option<String>,
    #[serde(default = "default_boot_order")]
    pub boot_order: String,
    #[serde(default)]
    pub iso_path: Option<String>,
    #[serde(default)]
    pub boot_from_disk: bool,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub bridge_name: Option<String>,
    #[serde(default)]
    pub display_protocol: DisplayProtocol,
}

pub fn default_boot_order() -> String {
    "cd".to_string()
}

/// Partial update, applied only while the VM is stopped.
/// Empty strings clear the optional path/bridge fields.
#[derive(Debug, Serialize, Deserialize, Clone, Default, utoipa::ToSchema)]
pub struct VmSpecPatch {
    pub cpu_cores: Option<i32>,
    pub ram_mb: Option<i32>,
    pub physical_disk: Option<String>,
    pub boot_order: Option<String>,
    pub iso_path: Option<String>,
    pub boot_from_disk: Option<bool>,
    pub network_mode: Option<NetworkMode>,
    pub bridge_name: Option<String>,
    pub display_protocol: Option<DisplayProtocol>,
}

impl VmSpecPatch {
    pub fn is_empty(&self) -> bool {
        self.cpu_cores.is_none()
            && self.ram_mb.is_none()
            && self.physical_disk.is_none()
            && self.boot_order.is_none()
            && self.iso_path.is_none()
            && self.boot_from_disk.is_none()
            && self.network_mode.is_none()
            && self.bridge_name.is_none()
            && self.display_protocol.is_none()
    }
}
