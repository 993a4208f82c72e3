use axum::extract::State;
use hostplane_common::{IsoImage, NetworkBridge, PhysicalDisk};
use std::sync::Arc;

use crate::app::AppState;
use crate::error::{ok, ApiResult};

#[utoipa::path(get, path = "/host/isos", responses((status = 200, body = Vec<IsoImage>)))]
pub async fn list_isos(State(state): State<Arc<AppState>>) -> ApiResult<Vec<IsoImage>> {
    ok(state.orchestrator.list_isos().await?)
}

#[utoipa::path(get, path = "/host/disks", responses((status = 200, body = Vec<PhysicalDisk>)))]
pub async fn list_physical_disks(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PhysicalDisk>> {
    ok(state.orchestrator.list_physical_disks().await?)
}

#[utoipa::path(get, path = "/host/bridges", responses((status = 200, body = Vec<NetworkBridge>)))]
pub async fn list_network_bridges(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<NetworkBridge>> {
    ok(state.orchestrator.list_network_bridges().await?)
}
