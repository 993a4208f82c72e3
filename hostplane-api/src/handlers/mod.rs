// Handlers module - one function per orchestrator operation
pub mod backups;
pub mod host;
pub mod vms;

use serde::Deserialize;
use utoipa::IntoParams;

/// Gate for destructive operations (delete VM, delete backup, restore backup).
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConfirmParams {
    #[serde(default)]
    pub confirm: bool,
}

impl ConfirmParams {
    pub fn require(&self, what: &str) -> Result<(), crate::error::ApiError> {
        if self.confirm {
            Ok(())
        } else {
            Err(crate::error::ApiError::ConfirmationRequired(what.to_string()))
        }
    }
}
