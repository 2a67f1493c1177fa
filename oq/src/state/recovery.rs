//! Crash recovery
//!
//! Operations left `running` by a previous process are demoted to `queued`
//! before the scheduler starts. The interrupted run is recorded in the
//! attempt history but does not consume the retry budget.

use tracing::{debug, info, warn};

use crate::domain::{OperationFilter, OperationStatus, now_ms};
use crate::error::QueueResult;

use super::OperationStore;

/// Recovery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Runs demoted from `running` to `queued`
    pub interrupted: usize,
    /// Scheduled operations already past due (promoted on the first tick)
    pub overdue: usize,
    /// Operations waiting for a slot after recovery
    pub queued: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "interrupted: {}, overdue: {}, queued: {}",
            self.interrupted, self.overdue, self.queued
        )
    }
}

/// Reconcile operations left over from a previous process
pub async fn recover(store: &OperationStore) -> QueueResult<RecoveryStats> {
    debug!("recover: called");
    let mut stats = RecoveryStats::default();
    let now = now_ms();

    let running = store.list(OperationFilter::with_status(OperationStatus::Running)).await?;
    for op in running {
        warn!(
            id = %op.id,
            attempt = op.current_attempt,
            "Demoting operation interrupted by process exit"
        );
        store.update(&op.id, move |op| op.interrupt(now)).await?;
        stats.interrupted += 1;
    }

    let scheduled = store
        .list(OperationFilter::with_status(OperationStatus::Scheduled))
        .await?;
    stats.overdue = scheduled.iter().filter(|op| op.is_due(now)).count();

    stats.queued = store
        .list(OperationFilter::with_status(OperationStatus::Queued))
        .await?
        .len();

    if stats.interrupted > 0 || stats.overdue > 0 {
        info!("Recovery found incomplete work: {}", stats);
    } else {
        debug!("Recovery found no interrupted work");
    }
    Ok(stats)
}
