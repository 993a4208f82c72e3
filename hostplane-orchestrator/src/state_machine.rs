use chrono::Utc;
use hostplane_common::{OrchestratorError, VirtualMachine, VmStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::VmStore;

/// Record a state transition in vm_state_history. Best effort: a history write
/// failure never undoes the transition itself.
pub async fn log_state_transition(
    store: &dyn VmStore,
    vm_id: Uuid,
    from: Option<VmStatus>,
    to: VmStatus,
    reason: &str,
) {
    if let Err(e) = store.record_transition(vm_id, from, to, reason).await {
        warn!(%vm_id, error = %e, "failed to record state transition");
    }
}

/// Creation entry of the history.
pub async fn created(store: &dyn VmStore, vm: &VirtualMachine) {
    log_state_transition(store, vm.id, None, vm.status, "created").await;
}

/// STOPPED/ERROR/PAUSED -> RUNNING (idempotent).
/// Returns false when the VM was already running or is gone.
pub async fn to_running(
    store: &dyn VmStore,
    vm: &VirtualMachine,
    pid: u32,
    reason: &str,
) -> Result<bool, OrchestratorError> {
    if store.mark_running(vm.id, pid, Utc::now()).await? {
        info!(vm_id = %vm.id, vm = %vm.name, pid, from = vm.status.as_str(), "[state_machine] -> running ({})", reason);
        log_state_transition(store, vm.id, Some(vm.status), VmStatus::Running, reason).await;
        Ok(true)
    } else {
        warn!(vm_id = %vm.id, "[state_machine] to_running: no rows affected (already running or deleted)");
        Ok(false)
    }
}

/// RUNNING -> STOPPED (idempotent), only if the stored pid is still `expected_pid`.
pub async fn running_to_stopped(
    store: &dyn VmStore,
    vm: &VirtualMachine,
    expected_pid: Option<i32>,
    reason: &str,
) -> Result<bool, OrchestratorError> {
    if store.mark_stopped(vm.id, expected_pid).await? {
        info!(vm_id = %vm.id, vm = %vm.name, pid = ?expected_pid, "[state_machine] running -> stopped ({})", reason);
        log_state_transition(store, vm.id, Some(VmStatus::Running), VmStatus::Stopped, reason).await;
        Ok(true)
    } else {
        Ok(false)
    }
}
