use crate::app::AppState;
use crate::handlers::host;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

/// Host inventory for form population.
pub fn create_host_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/host/isos", get(host::list_isos))
        .route("/host/disks", get(host::list_physical_disks))
        .route("/host/bridges", get(host::list_network_bridges))
}
