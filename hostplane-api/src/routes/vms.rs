use crate::app::AppState;
use crate::handlers::vms;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn create_vm_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/vms", get(vms::list_vms).post(vms::create_vm))
        .route(
            "/vms/{id}",
            get(vms::get_vm).patch(vms::update_vm).delete(vms::delete_vm),
        )
        .route("/vms/{id}/start", post(vms::start_vm))
        .route("/vms/{id}/stop", post(vms::stop_vm))
        .route("/vms/{id}/restart", post(vms::restart_vm))
        .route("/vms/{id}/status", get(vms::vm_status))
        .route("/vms/{id}/logs", get(vms::vm_logs))
        .route("/vms/{id}/history", get(vms::vm_history))
        .route("/vms/{id}/spice", get(vms::spice_file))
}
