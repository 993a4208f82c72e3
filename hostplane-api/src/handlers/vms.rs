use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hostplane_common::{
    ApiEnvelope, VirtualMachine, VmRuntimeStatus, VmSpec, VmSpecPatch, VmTransition,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::ConfirmParams;
use crate::app::AppState;
use crate::error::{ok, ApiError, ApiResult};

pub const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StopParams {
    /// SIGKILL instead of SIGTERM + grace period.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogParams {
    pub lines: Option<usize>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct VmLogs {
    pub vm_id: Uuid,
    pub content: String,
}

#[utoipa::path(
    get,
    path = "/vms",
    responses((status = 200, description = "All VMs", body = Vec<VirtualMachine>))
)]
pub async fn list_vms(State(state): State<Arc<AppState>>) -> ApiResult<Vec<VirtualMachine>> {
    ok(state.orchestrator.list_vms().await?)
}

#[utoipa::path(
    post,
    path = "/vms",
    request_body = VmSpec,
    responses(
        (status = 201, description = "VM created (stopped)", body = VirtualMachine),
        (status = 400, description = "Invalid spec"),
        (status = 503, description = "No free display port")
    )
)]
pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<VmSpec>,
) -> Result<(StatusCode, Json<ApiEnvelope<VirtualMachine>>), ApiError> {
    let vm = state.orchestrator.create(spec).await?;
    Ok((StatusCode::CREATED, Json(ApiEnvelope::ok(vm))))
}

#[utoipa::path(
    get,
    path = "/vms/{id}",
    params(("id" = Uuid, Path, description = "VM id")),
    responses((status = 200, body = VirtualMachine), (status = 404, description = "Unknown VM"))
)]
pub async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<VirtualMachine> {
    ok(state.orchestrator.get_vm(id).await?)
}

#[utoipa::path(
    patch,
    path = "/vms/{id}",
    params(("id" = Uuid, Path, description = "VM id")),
    request_body = VmSpecPatch,
    responses(
        (status = 200, body = VirtualMachine),
        (status = 409, description = "VM is running")
    )
)]
pub async fn update_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<VmSpecPatch>,
) -> ApiResult<VirtualMachine> {
    ok(state.orchestrator.update(id, patch).await?)
}

#[utoipa::path(
    delete,
    path = "/vms/{id}",
    params(("id" = Uuid, Path, description = "VM id"), ConfirmParams),
    responses(
        (status = 200, description = "VM deleted"),
        (status = 400, description = "Missing confirmation"),
        (status = 409, description = "Backup or restore in progress")
    )
)]
pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(confirm): Query<ConfirmParams>,
) -> ApiResult<()> {
    confirm.require("deleting a VM")?;
    state.orchestrator.delete(id).await?;
    ok(())
}

#[utoipa::path(
    post,
    path = "/vms/{id}/start",
    params(("id" = Uuid, Path, description = "VM id")),
    responses(
        (status = 200, body = VirtualMachine),
        (status = 409, description = "Already running or restore in progress"),
        (status = 500, description = "Hypervisor failed to launch")
    )
)]
pub async fn start_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<VirtualMachine> {
    ok(state.orchestrator.start(id).await?)
}

#[utoipa::path(
    post,
    path = "/vms/{id}/stop",
    params(("id" = Uuid, Path, description = "VM id"), StopParams),
    responses((status = 200, body = VirtualMachine), (status = 409, description = "Not running"))
)]
pub async fn stop_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<StopParams>,
) -> ApiResult<VirtualMachine> {
    ok(state.orchestrator.stop(id, params.force).await?)
}

#[utoipa::path(
    post,
    path = "/vms/{id}/restart",
    params(("id" = Uuid, Path, description = "VM id")),
    responses((status = 200, body = VirtualMachine))
)]
pub async fn restart_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<VirtualMachine> {
    ok(state.orchestrator.restart(id).await?)
}

/// Reconciled status: a dead hypervisor is reported (and recorded) as stopped.
#[utoipa::path(
    get,
    path = "/vms/{id}/status",
    params(("id" = Uuid, Path, description = "VM id")),
    responses((status = 200, body = VmRuntimeStatus))
)]
pub async fn vm_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<VmRuntimeStatus> {
    ok(state.orchestrator.reconcile(id).await?)
}

#[utoipa::path(
    get,
    path = "/vms/{id}/logs",
    params(("id" = Uuid, Path, description = "VM id"), LogParams),
    responses((status = 200, body = VmLogs))
)]
pub async fn vm_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<LogParams>,
) -> ApiResult<VmLogs> {
    let content = state
        .orchestrator
        .logs(id, params.lines.unwrap_or(DEFAULT_LOG_LINES))
        .await?;
    ok(VmLogs { vm_id: id, content })
}

#[utoipa::path(
    get,
    path = "/vms/{id}/history",
    params(("id" = Uuid, Path, description = "VM id")),
    responses((status = 200, body = Vec<VmTransition>))
)]
pub async fn vm_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<VmTransition>> {
    ok(state.orchestrator.transitions(id).await?)
}

/// Remote-viewer connection file. Served raw, not wrapped in the JSON envelope.
#[utoipa::path(
    get,
    path = "/vms/{id}/spice",
    params(("id" = Uuid, Path, description = "VM id")),
    responses(
        (status = 200, description = "virt-viewer document", content_type = "application/x-virt-viewer"),
        (status = 422, description = "VM does not use SPICE")
    )
)]
pub async fn spice_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let file = state.orchestrator.generate_spice_file(id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, file.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.file_name),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        file.body,
    )
        .into_response())
}
