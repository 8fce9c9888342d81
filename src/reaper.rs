use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::ledger::WalCommitmentStore;
use crate::tenant::TenantManager;

/// Background task that drops engines nobody has used for `idle`, along
/// with the per-tenant state their commitment store keeps.
/// Evicted tenants are rebuilt from their sources on next access.
pub async fn run_reaper(manager: Arc<TenantManager>, idle: Duration, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let evicted = manager.evict_idle(idle);
        if evicted > 0 {
            info!(evicted, remaining = manager.tenant_count(), "reaped idle tenants");
        }
    }
}

/// Background task that compacts tenant logs once `threshold` of their
/// entries no longer describe a live commitment.
pub async fn run_compactor(store: Arc<WalCommitmentStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let compacted = store.compact_if_needed(threshold).await;
        debug!(compacted, "compaction pass");
    }
}
