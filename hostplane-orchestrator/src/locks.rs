use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedMutexGuard};
use uuid::Uuid;

/// Per-VM operation serialisation plus one host-wide lock for creation
/// (port allocation and disk path reservation).
#[derive(Default)]
pub struct VmLocks {
    per_vm: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    creation: AsyncMutex<()>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held for the whole of start/stop/restart/update/delete/backup/restore on one VM.
    pub async fn lock(&self, vm_id: Uuid) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.per_vm.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(vm_id).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub async fn creation(&self) -> AsyncMutexGuard<'_, ()> {
        self.creation.lock().await
    }

    /// Drop the slot of a deleted VM. Holders of an existing guard are unaffected.
    pub fn forget(&self, vm_id: Uuid) {
        self.per_vm
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&vm_id);
    }

    pub fn tracked(&self) -> usize {
        self.per_vm.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
