use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use hostplane_common::{ApiEnvelope, BackupJob, BackupStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::ConfirmParams;
use crate::app::AppState;
use crate::error::{ok, ApiError, ApiResult};

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateBackupRequest {
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BackupStatusResponse {
    pub job_id: Uuid,
    pub status: BackupStatus,
}

/// Queues a backup and returns at once; poll `/backups/{id}/status`.
#[utoipa::path(
    post,
    path = "/vms/{id}/backups",
    params(("id" = Uuid, Path, description = "VM id")),
    request_body = CreateBackupRequest,
    responses(
        (status = 202, description = "Backup job queued", body = BackupJob),
        (status = 409, description = "Another job is in flight for this VM")
    )
)]
pub async fn create_backup(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<Uuid>,
    Json(req): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<BackupJob>>), ApiError> {
    let job = state.orchestrator.create_backup(vm_id, req.notes).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiEnvelope::ok(job))))
}

#[utoipa::path(
    get,
    path = "/vms/{id}/backups",
    params(("id" = Uuid, Path, description = "VM id")),
    responses((status = 200, body = Vec<BackupJob>))
)]
pub async fn list_vm_backups(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<Uuid>,
) -> ApiResult<Vec<BackupJob>> {
    ok(state.orchestrator.list_backups(vm_id).await?)
}

#[utoipa::path(
    get,
    path = "/backups",
    responses((status = 200, body = Vec<BackupJob>))
)]
pub async fn list_all_backups(State(state): State<Arc<AppState>>) -> ApiResult<Vec<BackupJob>> {
    ok(state.orchestrator.list_all_backups().await?)
}

#[utoipa::path(
    get,
    path = "/backups/{id}",
    params(("id" = Uuid, Path, description = "Backup job id")),
    responses((status = 200, body = BackupJob), (status = 404, description = "Unknown job"))
)]
pub async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<BackupJob> {
    ok(state.orchestrator.get_backup(job_id).await?)
}

#[utoipa::path(
    get,
    path = "/backups/{id}/status",
    params(("id" = Uuid, Path, description = "Backup job id")),
    responses((status = 200, body = BackupStatusResponse))
)]
pub async fn backup_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<BackupStatusResponse> {
    let status = state.orchestrator.check_backup_status(job_id).await?;
    ok(BackupStatusResponse { job_id, status })
}

#[utoipa::path(
    post,
    path = "/backups/{id}/restore",
    params(("id" = Uuid, Path, description = "Backup job id"), ConfirmParams),
    responses(
        (status = 202, description = "Restore queued", body = BackupJob),
        (status = 409, description = "Job not completed, VM running, or another job in flight")
    )
)]
pub async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Query(confirm): Query<ConfirmParams>,
) -> Result<(StatusCode, Json<ApiEnvelope<BackupJob>>), ApiError> {
    confirm.require("restoring a backup")?;
    let job = state.orchestrator.restore_backup(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiEnvelope::ok(job))))
}

#[utoipa::path(
    delete,
    path = "/backups/{id}",
    params(("id" = Uuid, Path, description = "Backup job id"), ConfirmParams),
    responses((status = 200, description = "Backup file and record removed"))
)]
pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Query(confirm): Query<ConfirmParams>,
) -> ApiResult<()> {
    confirm.require("deleting a backup")?;
    state.orchestrator.delete_backup(job_id).await?;
    ok(())
}
