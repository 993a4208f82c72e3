use crate::app::AppState;
use crate::handlers::backups;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn create_backup_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/vms/{id}/backups",
            get(backups::list_vm_backups).post(backups::create_backup),
        )
        .route("/backups", get(backups::list_all_backups))
        .route(
            "/backups/{id}",
            get(backups::get_backup).delete(backups::delete_backup),
        )
        .route("/backups/{id}/status", get(backups::backup_status))
        .route("/backups/{id}/restore", post(backups::restore_backup))
}
