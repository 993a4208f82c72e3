use crate::handlers::{backups, host, vms};
use hostplane_common::{
    ApiErrorBody, BackupCompression, BackupJob, BackupStatus, DiskFormat, DisplayProtocol,
    IsoImage, NetworkBridge, NetworkMode, PhysicalDisk, VirtualMachine, VmRuntimeStatus, VmSpec,
    VmSpecPatch, VmStatus, VmTransition,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        // VMs
        vms::list_vms,
        vms::create_vm,
        vms::get_vm,
        vms::update_vm,
        vms::delete_vm,
        vms::start_vm,
        vms::stop_vm,
        vms::restart_vm,
        vms::vm_status,
        vms::vm_logs,
        vms::vm_history,
        vms::spice_file,
        // Backups
        backups::create_backup,
        backups::list_vm_backups,
        backups::list_all_backups,
        backups::get_backup,
        backups::backup_status,
        backups::restore_backup,
        backups::delete_backup,
        // Host inventory
        host::list_isos,
        host::list_physical_disks,
        host::list_network_bridges
    ),
    components(
        schemas(
            VirtualMachine,
            VmSpec,
            VmSpecPatch,
            VmStatus,
            VmRuntimeStatus,
            VmTransition,
            DiskFormat,
            NetworkMode,
            DisplayProtocol,
            BackupJob,
            BackupStatus,
            BackupCompression,
            IsoImage,
            PhysicalDisk,
            NetworkBridge,
            ApiErrorBody,
            vms::VmLogs,
            backups::CreateBackupRequest,
            backups::BackupStatusResponse
        )
    ),
    tags(
        (name = "hostplane", description = "Single-host VM lifecycle API. Every JSON response is wrapped in { success, data | error }.")
    )
)]
pub struct ApiDoc;
