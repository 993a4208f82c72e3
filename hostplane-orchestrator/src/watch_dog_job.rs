use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::service::Orchestrator;

pub const WATCH_DOG_INTERVAL: Duration = Duration::from_secs(30);

/// job-watch-dog: reconciles every VM believed running, so a dead hypervisor is
/// noticed without anyone polling its status.
pub async fn run(orchestrator: Arc<Orchestrator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    info!("🐶 job-watch-dog started (checking running VMs every {:?})", every);

    loop {
        interval.tick().await;

        match orchestrator.reconcile_all().await {
            Ok(count) if count > 0 => info!("🐶 job-watch-dog: {} VM(s) reconciled to stopped", count),
            Ok(_) => {}
            Err(e) => error!("❌ job-watch-dog error: {}", e),
        }
    }
}
