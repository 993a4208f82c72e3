use hostplane_common::OrchestratorError;
use tracing::{info, warn};

use crate::store::VmStore;

pub const INTERRUPTED_NOTE: &str = "interrupted: orchestrator stopped while the job was running";

/// job-recovery (startup): a claimed job whose worker died with the previous
/// process can't be resumed, so it is failed. Unclaimed jobs are left to the
/// requeue loop.
pub async fn recover_interrupted_jobs(store: &dyn VmStore) -> Result<u64, OrchestratorError> {
    let failed = store.fail_interrupted_jobs(INTERRUPTED_NOTE).await?;
    if failed > 0 {
        warn!("job-recovery: marked {} interrupted job(s) as failed", failed);
    } else {
        info!("job-recovery: no interrupted jobs");
    }
    Ok(failed)
}
