//! Statistics - per-status counts computed from a fresh store snapshot

use serde::Serialize;
use tracing::debug;

use crate::domain::{Operation, OperationFilter, OperationStatus};
use crate::error::QueueResult;
use crate::state::OperationStore;

/// Operation counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total: usize,
    pub queued: usize,
    pub scheduled: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl Statistics {
    pub fn from_operations(ops: &[Operation]) -> Self {
        let mut stats = Self {
            total: ops.len(),
            ..Default::default()
        };
        for op in ops {
            *stats.slot(op.status) += 1;
        }
        stats
    }

    fn slot(&mut self, status: OperationStatus) -> &mut usize {
        match status {
            OperationStatus::Queued => &mut self.queued,
            OperationStatus::Scheduled => &mut self.scheduled,
            OperationStatus::Running => &mut self.running,
            OperationStatus::Paused => &mut self.paused,
            OperationStatus::Completed => &mut self.completed,
            OperationStatus::Failed => &mut self.failed,
            OperationStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub fn count(&self, status: OperationStatus) -> usize {
        match status {
            OperationStatus::Queued => self.queued,
            OperationStatus::Scheduled => self.scheduled,
            OperationStatus::Running => self.running,
            OperationStatus::Paused => self.paused,
            OperationStatus::Completed => self.completed,
            OperationStatus::Failed => self.failed,
            OperationStatus::Cancelled => self.cancelled,
        }
    }

    /// Operations that are not terminal
    pub fn pending(&self) -> usize {
        self.queued + self.scheduled + self.running + self.paused
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total: {}, queued: {}, scheduled: {}, running: {}, paused: {}, completed: {}, failed: {}, cancelled: {}",
            self.total,
            self.queued,
            self.scheduled,
            self.running,
            self.paused,
            self.completed,
            self.failed,
            self.cancelled
        )
    }
}

/// Read every operation and count them
pub async fn collect(store: &OperationStore) -> QueueResult<Statistics> {
    debug!("collect: called");
    let ops = store.list(OperationFilter::all()).await?;
    Ok(Statistics::from_operations(&ops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OperationSpec, OperationType, RetryPolicy};

    fn op(status: OperationStatus) -> Operation {
        let mut op = Operation::from_spec(
            OperationSpec::new(OperationType::Copy, vec![]),
            RetryPolicy::default(),
            0,
        );
        op.status = status;
        op
    }

    #[test]
    fn test_from_operations() {
        let ops = vec![
            op(OperationStatus::Queued),
            op(OperationStatus::Queued),
            op(OperationStatus::Running),
            op(OperationStatus::Failed),
            op(OperationStatus::Cancelled),
        ];
        let stats = Statistics::from_operations(&ops);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.count(OperationStatus::Failed), 1);
        assert_eq!(stats.pending(), 3);

        let sum: usize = OperationStatus::ALL.iter().map(|s| stats.count(*s)).sum();
        assert_eq!(sum, stats.total);
    }

    #[test]
    fn test_empty() {
        let stats = Statistics::from_operations(&[]);
        assert_eq!(stats, Statistics::default());
        assert!(stats.to_string().starts_with("total: 0"));
    }
}
