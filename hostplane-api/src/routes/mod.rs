// Routes module - Centralizes all route definitions
pub mod backups;
pub mod host;
pub mod public;
pub mod vms;

use crate::app::AppState;
use axum::Router;
use std::sync::Arc;

/// Build the main application router
pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(public::create_public_routes())
        .merge(vms::create_vm_routes())
        .merge(backups::create_backup_routes())
        .merge(host::create_host_routes())
}
