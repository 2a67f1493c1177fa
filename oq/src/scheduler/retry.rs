//! Retry manager - settles a finished run into the operation's next state

use tracing::{debug, info, warn};

use crate::domain::{AttemptRecord, ItemResult, Operation, OperationStatus};
use crate::error::ExecutionError;

use super::pool::StopReason;

/// How an executor run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The executor returned item results (possibly a partial list after a stop)
    Finished(Vec<ItemResult>),
    /// The run as a whole failed
    Failed(ExecutionError),
    /// Nothing is registered for the operation type
    NoExecutor,
}

/// Applies the partial-failure and retry policies
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryManager;

impl RetryManager {
    pub fn new() -> Self {
        Self
    }

    /// Backoff before the next automatic attempt, or `None` once the budget is spent
    pub fn next_delay_ms(&self, op: &Operation) -> Option<u64> {
        if op.current_attempt < op.retry_policy.max_attempts {
            Some(op.retry_policy.backoff.delay_ms(op.current_attempt))
        } else {
            None
        }
    }

    /// Write the post-run state of a `running` operation
    ///
    /// A stop request wins over the run's own outcome: cancel and shutdown
    /// end `cancelled`, pause parks the operation as `paused` with its
    /// partial results kept.
    pub fn settle(&self, op: &mut Operation, outcome: RunOutcome, stop: Option<StopReason>, now: i64) {
        debug!(id = %op.id, ?stop, "RetryManager::settle: called");
        op.current_item = None;

        match (stop, outcome) {
            (Some(StopReason::Cancel | StopReason::Shutdown), outcome) => {
                if let RunOutcome::Finished(results) = outcome {
                    op.record_results(results);
                }
                op.status = OperationStatus::Cancelled;
                op.completed_at = Some(now);
                info!(id = %op.id, ?stop, processed = op.processed_count, "Operation cancelled");
            }
            (Some(StopReason::Pause), RunOutcome::Finished(results)) => {
                op.record_results(results);
                if op.remaining_items().is_empty() {
                    // Pause arrived after the last checkpoint
                    self.complete(op, now);
                } else {
                    self.pause(op);
                }
            }
            (Some(StopReason::Pause), _) => self.pause(op),
            (None, RunOutcome::Finished(results)) => {
                op.record_results(results);
                self.complete(op, now);
            }
            (None, RunOutcome::NoExecutor) => {
                let error = format!("no executor registered for {}", op.operation_type);
                self.record_attempt(op, &error, now);
                op.error_message = Some(error);
                op.status = OperationStatus::Failed;
                op.completed_at = Some(now);
                warn!(id = %op.id, operation_type = %op.operation_type, "No executor registered");
            }
            (None, RunOutcome::Failed(error)) => self.fail(op, error, now),
        }
    }

    fn pause(&self, op: &mut Operation) {
        // The interrupted run does not count against the budget
        op.current_attempt = op.current_attempt.saturating_sub(1);
        op.status = OperationStatus::Paused;
        info!(id = %op.id, remaining = op.remaining_items().len(), "Operation paused");
    }

    fn complete(&self, op: &mut Operation, now: i64) {
        op.completed_at = Some(now);
        if op.processed_count > 0 && op.failed_count == op.processed_count {
            op.status = OperationStatus::Failed;
            op.error_message = Some(format!("all {} items failed", op.processed_count));
            warn!(id = %op.id, failed = op.failed_count, "All items failed");
        } else {
            op.status = OperationStatus::Completed;
            op.error_message = None;
            info!(
                id = %op.id,
                processed = op.processed_count,
                failed = op.failed_count,
                "Operation completed"
            );
        }
    }

    fn fail(&self, op: &mut Operation, error: ExecutionError, now: i64) {
        let message = error.to_string();
        self.record_attempt(op, &message, now);
        op.error_message = Some(message);

        match self.next_delay_ms(op) {
            Some(delay) => {
                op.reset_progress();
                op.status = OperationStatus::Scheduled;
                let delay_ms = i64::try_from(delay).unwrap_or(i64::MAX);
                op.scheduled_at = Some(now.saturating_add(delay_ms));
                info!(
                    id = %op.id,
                    attempt = op.current_attempt,
                    max_attempts = op.retry_policy.max_attempts,
                    delay_ms = delay,
                    "Operation failed, retry scheduled"
                );
            }
            None => {
                op.status = OperationStatus::Failed;
                op.completed_at = Some(now);
                warn!(
                    id = %op.id,
                    attempts = op.current_attempt,
                    error = op.error_message.as_deref().unwrap_or_default(),
                    "Operation failed, attempts exhausted"
                );
            }
        }
    }

    fn record_attempt(&self, op: &mut Operation, error: &str, now: i64) {
        op.retry_attempts.push(AttemptRecord {
            attempt_number: op.current_attempt,
            started_at: op.started_at.unwrap_or(now),
            ended_at: now,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackoffPolicy, BackoffStrategy, OperationSpec, OperationType, RetryPolicy};

    fn running(items: usize, max_attempts: u32) -> Operation {
        let items = (0..items).map(|i| format!("/f{}", i)).collect();
        let policy = RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffPolicy {
                strategy: BackoffStrategy::Exponential,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            });
        let mut op = Operation::from_spec(
            OperationSpec::new(OperationType::BatchRename, items).with_retry_policy(policy),
            RetryPolicy::default(),
            0,
        );
        op.admit(1_000).unwrap();
        op
    }

    fn results(op: &Operation, failures: usize) -> Vec<ItemResult> {
        op.items
            .iter()
            .enumerate()
            .map(|(i, path)| {
                if i < failures {
                    ItemResult::failed(path.clone(), "locked")
                } else {
                    ItemResult::ok(path.clone())
                }
            })
            .collect()
    }

    #[test]
    fn test_partial_failure_completes() {
        let mut op = running(10, 3);
        let res = results(&op, 1);
        RetryManager::new().settle(&mut op, RunOutcome::Finished(res), None, 2_000);

        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.processed_count, 10);
        assert_eq!(op.failed_count, 1);
        assert_eq!(op.completed_at, Some(2_000));
        assert!(op.retry_attempts.is_empty());
    }

    #[test]
    fn test_all_items_failed() {
        let mut op = running(4, 3);
        let res = results(&op, 4);
        RetryManager::new().settle(&mut op, RunOutcome::Finished(res), None, 2_000);

        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error_message.as_deref(), Some("all 4 items failed"));
        // Item failures never trigger automatic retry
        assert!(op.retry_attempts.is_empty());
    }

    #[test]
    fn test_empty_results_complete() {
        let mut op = running(0, 3);
        RetryManager::new().settle(&mut op, RunOutcome::Finished(vec![]), None, 2_000);
        assert_eq!(op.status, OperationStatus::Completed);
    }

    #[test]
    fn test_failure_schedules_retry_with_backoff() {
        let mut op = running(2, 3);
        op.record_results(vec![ItemResult::ok("/f0")]);
        RetryManager::new().settle(
            &mut op,
            RunOutcome::Failed(ExecutionError::Failed("disk full".to_string())),
            None,
            5_000,
        );

        assert_eq!(op.status, OperationStatus::Scheduled);
        assert_eq!(op.scheduled_at, Some(5_100));
        assert_eq!(op.processed_count, 0);
        assert!(op.results.is_empty());
        assert_eq!(op.retry_attempts.len(), 1);
        assert_eq!(op.retry_attempts[0].attempt_number, 1);
        assert_eq!(op.retry_attempts[0].started_at, 1_000);
        assert_eq!(op.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_huge_backoff_saturates() {
        let policy = RetryPolicy::default().with_backoff(BackoffPolicy {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
        });
        let mut op = Operation::from_spec(
            OperationSpec::new(OperationType::Extract, vec!["/f".to_string()]).with_retry_policy(policy),
            RetryPolicy::default(),
            0,
        );
        op.admit(1_000).unwrap();
        RetryManager::new().settle(
            &mut op,
            RunOutcome::Failed(ExecutionError::Failed("io".to_string())),
            None,
            5_000,
        );

        assert_eq!(op.status, OperationStatus::Scheduled);
        assert_eq!(op.scheduled_at, Some(i64::MAX));
        assert!(!op.is_due(i64::MAX - 1));
    }

    #[test]
    fn test_failure_exhausts_budget() {
        let mut op = running(1, 3);
        let manager = RetryManager::new();
        for attempt in 1..=3 {
            assert_eq!(op.current_attempt, attempt);
            manager.settle(
                &mut op,
                RunOutcome::Failed(ExecutionError::Failed(format!("boom {}", attempt))),
                None,
                10_000 * i64::from(attempt),
            );
            if attempt < 3 {
                assert_eq!(op.status, OperationStatus::Scheduled);
                op.promote().unwrap();
                op.admit(10_000 * i64::from(attempt) + 500).unwrap();
            }
        }

        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.current_attempt, 3);
        assert_eq!(op.retry_attempts.len(), 3);
        assert_eq!(op.error_message.as_deref(), Some("boom 3"));
        assert!(manager.next_delay_ms(&op).is_none());
    }

    #[test]
    fn test_no_executor_fails_without_retry() {
        let mut op = running(1, 5);
        RetryManager::new().settle(&mut op, RunOutcome::NoExecutor, None, 2_000);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(
            op.error_message.as_deref(),
            Some("no executor registered for batch_rename")
        );
    }

    #[test]
    fn test_cancel_keeps_partial_results() {
        let mut op = running(3, 3);
        RetryManager::new().settle(
            &mut op,
            RunOutcome::Finished(vec![ItemResult::ok("/f0")]),
            Some(StopReason::Cancel),
            2_000,
        );
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert_eq!(op.processed_count, 1);
    }

    #[test]
    fn test_cancel_wins_over_failure() {
        let mut op = running(3, 3);
        RetryManager::new().settle(
            &mut op,
            RunOutcome::Failed(ExecutionError::Failed("x".to_string())),
            Some(StopReason::Shutdown),
            2_000,
        );
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert!(op.retry_attempts.is_empty());
    }

    #[test]
    fn test_pause_keeps_results_and_attempt() {
        let mut op = running(3, 3);
        RetryManager::new().settle(
            &mut op,
            RunOutcome::Finished(vec![ItemResult::ok("/f0")]),
            Some(StopReason::Pause),
            2_000,
        );
        assert_eq!(op.status, OperationStatus::Paused);
        assert_eq!(op.current_attempt, 0);
        assert_eq!(op.remaining_items(), vec!["/f1".to_string(), "/f2".to_string()]);
    }

    #[test]
    fn test_pause_after_last_item_completes() {
        let mut op = running(2, 3);
        let res = results(&op, 0);
        RetryManager::new().settle(&mut op, RunOutcome::Finished(res), Some(StopReason::Pause), 2_000);
        assert_eq!(op.status, OperationStatus::Completed);
    }
}
