//! Operation domain type
//!
//! One unit of file-management work and everything recorded about it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskstore::{IndexValue, Record};

use super::id::generate_id;
use super::{Priority, RetryPolicy};
use crate::error::{QueueError, QueueResult};

/// Error recorded for a run cut short by a process exit
pub const INTERRUPTED_ERROR: &str = "interrupted: process exited while running";

/// Kind of file operation; selects the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Copy,
    Move,
    Delete,
    Archive,
    Extract,
    BatchRename,
    BatchAttribute,
    Custom,
}

impl OperationType {
    pub const ALL: [OperationType; 8] = [
        Self::Copy,
        Self::Move,
        Self::Delete,
        Self::Archive,
        Self::Extract,
        Self::BatchRename,
        Self::BatchAttribute,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Archive => "archive",
            Self::Extract => "extract",
            Self::BatchRename => "batch_rename",
            Self::BatchAttribute => "batch_attribute",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("Unknown operation type: {}", s))
    }
}

/// Lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting for a worker slot
    #[default]
    Queued,
    /// Waiting for `scheduled_at` (first run or retry backoff)
    Scheduled,
    /// Held by an executor
    Running,
    /// Held by the user; does not occupy a slot
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 7] = [
        Self::Queued,
        Self::Scheduled,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| format!("Unknown status: {}", s))
    }
}

/// Outcome for one item of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ItemResult {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            original_name: None,
            new_name: None,
            success: true,
            error_message: None,
        }
    }

    pub fn failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            original_name: None,
            new_name: None,
            success: false,
            error_message: Some(error.into()),
        }
    }

    pub fn renamed(path: impl Into<String>, original_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self {
            original_name: Some(original_name.into()),
            new_name: Some(new_name.into()),
            ..Self::ok(path)
        }
    }
}

/// One failed (or interrupted) run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub started_at: i64,
    pub ended_at: i64,
    pub error: String,
}

/// Submission input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub operation_type: OperationType,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix ms; a time in the future parks the operation as `scheduled`
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    /// `None` uses the configured default policy
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl OperationSpec {
    pub fn new(operation_type: OperationType, items: Vec<String>) -> Self {
        Self {
            operation_type,
            items,
            params: Value::Null,
            priority: Priority::default(),
            description: None,
            tags: Vec::new(),
            scheduled_at: None,
            retry_policy: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn scheduled_at(mut self, at_ms: i64) -> Self {
        self.scheduled_at = Some(at_ms);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// A persisted operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub priority: Priority,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub params: Value,

    pub created_at: i64,
    /// Submission order assigned by the store; breaks `created_at` ties
    #[serde(default)]
    pub seq: u64,
    pub updated_at: i64,
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,

    /// 0 before the first run; incremented at each admission
    pub current_attempt: u32,
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub retry_attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub error_message: Option<String>,

    pub items_count: u32,
    pub processed_count: u32,
    pub failed_count: u32,
    #[serde(default)]
    pub results: Vec<ItemResult>,
    #[serde(default)]
    pub current_item: Option<String>,
    #[serde(default)]
    pub bytes_processed: u64,

    /// Admission boost set by run-now; cleared when admitted
    #[serde(default)]
    pub run_now: bool,
}

impl Operation {
    /// Build a new operation from a submission
    pub fn from_spec(spec: OperationSpec, default_policy: RetryPolicy, now: i64) -> Self {
        let description = spec.description.as_deref().unwrap_or("");
        let status = match spec.scheduled_at {
            Some(at) if at > now => OperationStatus::Scheduled,
            _ => OperationStatus::Queued,
        };
        Self {
            id: generate_id(spec.operation_type.as_str(), description),
            operation_type: spec.operation_type,
            status,
            priority: spec.priority,
            description: spec.description,
            tags: spec.tags,
            items_count: spec.items.len() as u32,
            items: spec.items,
            params: spec.params,
            created_at: now,
            seq: 0,
            updated_at: now,
            scheduled_at: spec.scheduled_at,
            started_at: None,
            completed_at: None,
            current_attempt: 0,
            retry_policy: spec.retry_policy.unwrap_or(default_policy),
            retry_attempts: Vec::new(),
            error_message: None,
            processed_count: 0,
            failed_count: 0,
            results: Vec::new(),
            current_item: None,
            bytes_processed: 0,
            run_now: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Scheduled and past its `scheduled_at`
    pub fn is_due(&self, now: i64) -> bool {
        self.status == OperationStatus::Scheduled && self.scheduled_at.is_none_or(|at| at <= now)
    }

    fn transition_error(&self, action: &'static str) -> QueueError {
        QueueError::InvalidTransition {
            id: self.id.clone(),
            action,
            status: self.status,
        }
    }

    /// Clear everything recorded by the current run
    pub fn reset_progress(&mut self) {
        self.processed_count = 0;
        self.failed_count = 0;
        self.results.clear();
        self.current_item = None;
        self.bytes_processed = 0;
    }

    /// Items that have no recorded result yet
    pub fn remaining_items(&self) -> Vec<String> {
        let done: HashSet<&str> = self.results.iter().map(|r| r.path.as_str()).collect();
        self.items.iter().filter(|i| !done.contains(i.as_str())).cloned().collect()
    }

    /// Append item results and recompute the counters from `results`
    pub fn record_results(&mut self, results: Vec<ItemResult>) {
        self.results.extend(results);
        self.recount();
    }

    fn recount(&mut self) {
        let processed = self.results.len() as u32;
        // An executor may report items it discovered itself (e.g. directory expansion)
        self.items_count = self.items_count.max(processed);
        self.processed_count = processed;
        self.failed_count = (self.results.iter().filter(|r| !r.success).count() as u32).min(processed);
    }

    /// Promote a due scheduled operation
    pub fn promote(&mut self) -> QueueResult<()> {
        if self.status != OperationStatus::Scheduled {
            return Err(self.transition_error("promote"));
        }
        self.status = OperationStatus::Queued;
        Ok(())
    }

    /// Hand the operation to a worker
    pub fn admit(&mut self, now: i64) -> QueueResult<()> {
        if self.status != OperationStatus::Queued {
            return Err(self.transition_error("start"));
        }
        self.status = OperationStatus::Running;
        self.current_attempt += 1;
        self.started_at = Some(now);
        self.completed_at = None;
        self.current_item = None;
        self.run_now = false;
        Ok(())
    }

    /// Hold a queued or scheduled operation
    pub fn hold(&mut self) -> QueueResult<()> {
        match self.status {
            OperationStatus::Queued | OperationStatus::Scheduled => {
                self.status = OperationStatus::Paused;
                Ok(())
            }
            _ => Err(self.transition_error("pause")),
        }
    }

    /// Release a paused operation; back to `scheduled` if its time has not come
    pub fn resume(&mut self, now: i64) -> QueueResult<()> {
        if self.status != OperationStatus::Paused {
            return Err(self.transition_error("resume"));
        }
        self.status = match self.scheduled_at {
            Some(at) if at > now => OperationStatus::Scheduled,
            _ => OperationStatus::Queued,
        };
        Ok(())
    }

    /// Queue ahead of everything else
    pub fn boost(&mut self) -> QueueResult<()> {
        match self.status {
            OperationStatus::Queued | OperationStatus::Scheduled | OperationStatus::Paused => {
                self.status = OperationStatus::Queued;
                self.run_now = true;
                Ok(())
            }
            _ => Err(self.transition_error("run now")),
        }
    }

    /// Cancel an operation that is not running; terminal operations are left as they are
    pub fn cancel_idle(&mut self, now: i64) -> QueueResult<()> {
        match self.status {
            OperationStatus::Queued | OperationStatus::Scheduled | OperationStatus::Paused => {
                self.status = OperationStatus::Cancelled;
                self.completed_at = Some(now);
                self.run_now = false;
                Ok(())
            }
            status if status.is_terminal() => Ok(()),
            _ => Err(self.transition_error("cancel")),
        }
    }

    /// Manual retry of a failed or cancelled operation
    ///
    /// The attempt budget starts over; the attempt history is kept.
    pub fn requeue(&mut self) -> QueueResult<()> {
        match self.status {
            OperationStatus::Failed | OperationStatus::Cancelled => {
                self.status = OperationStatus::Queued;
                self.current_attempt = 0;
                self.error_message = None;
                self.scheduled_at = None;
                self.started_at = None;
                self.completed_at = None;
                self.reset_progress();
                Ok(())
            }
            _ => Err(self.transition_error("retry")),
        }
    }

    /// Demote a run that was cut short by a process exit
    ///
    /// The run is recorded but does not count against the attempt budget.
    pub fn interrupt(&mut self, now: i64) -> QueueResult<()> {
        if self.status != OperationStatus::Running {
            return Err(self.transition_error("interrupt"));
        }
        self.retry_attempts.push(AttemptRecord {
            attempt_number: self.current_attempt,
            started_at: self.started_at.unwrap_or(now),
            ended_at: now,
            error: INTERRUPTED_ERROR.to_string(),
        });
        self.status = OperationStatus::Queued;
        self.current_attempt = self.current_attempt.saturating_sub(1);
        self.reset_progress();
        Ok(())
    }
}

impl Record for Operation {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "operations"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.as_str().to_string()));
        fields.insert(
            "operation_type".to_string(),
            IndexValue::String(self.operation_type.as_str().to_string()),
        );
        fields.insert("priority".to_string(), IndexValue::Int(self.priority.rank()));
        fields.insert("run_now".to_string(), IndexValue::Bool(self.run_now));
        fields
    }
}

/// Selection for list queries; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    pub statuses: Vec<OperationStatus>,
    pub operation_type: Option<OperationType>,
    pub tag: Option<String>,
}

impl OperationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: OperationStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn with_statuses(statuses: &[OperationStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, op: &Operation) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&op.status))
            && self.operation_type.is_none_or(|t| t == op.operation_type)
            && self.tag.as_ref().is_none_or(|tag| op.tags.contains(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(items: &[&str]) -> Operation {
        let spec = OperationSpec::new(OperationType::Copy, items.iter().map(|s| s.to_string()).collect())
            .with_description("test copy");
        Operation::from_spec(spec, RetryPolicy::default(), 1_000)
    }

    #[test]
    fn test_from_spec() {
        let op = op(&["/a", "/b"]);
        assert!(op.id.contains("-copy-test-copy"));
        assert_eq!(op.status, OperationStatus::Queued);
        assert_eq!(op.items_count, 2);
        assert_eq!(op.current_attempt, 0);
        assert_eq!(op.created_at, 1_000);
    }

    #[test]
    fn test_from_spec_future_is_scheduled() {
        let spec = OperationSpec::new(OperationType::Delete, vec![]).scheduled_at(5_000);
        let op = Operation::from_spec(spec, RetryPolicy::default(), 1_000);
        assert_eq!(op.status, OperationStatus::Scheduled);
        assert!(!op.is_due(4_999));
        assert!(op.is_due(5_000));

        let spec = OperationSpec::new(OperationType::Delete, vec![]).scheduled_at(500);
        let op = Operation::from_spec(spec, RetryPolicy::default(), 1_000);
        assert_eq!(op.status, OperationStatus::Queued);
    }

    #[test]
    fn test_type_and_status_parse() {
        assert_eq!("batch-rename".parse::<OperationType>().unwrap(), OperationType::BatchRename);
        assert_eq!("COPY".parse::<OperationType>().unwrap(), OperationType::Copy);
        assert!("shred".parse::<OperationType>().is_err());
        assert_eq!("paused".parse::<OperationStatus>().unwrap(), OperationStatus::Paused);
        assert_eq!(
            serde_json::to_string(&OperationType::BatchAttribute).unwrap(),
            "\"batch_attribute\""
        );
    }

    #[test]
    fn test_record_results_counts() {
        let mut op = op(&["/a", "/b", "/c"]);
        op.record_results(vec![ItemResult::ok("/a"), ItemResult::failed("/b", "denied")]);
        assert_eq!(op.processed_count, 2);
        assert_eq!(op.failed_count, 1);
        assert_eq!(op.remaining_items(), vec!["/c".to_string()]);
        assert!(op.processed_count <= op.items_count);
    }

    #[test]
    fn test_admit_increments_attempt() {
        let mut op = op(&["/a"]);
        op.run_now = true;
        op.admit(2_000).unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.current_attempt, 1);
        assert_eq!(op.started_at, Some(2_000));
        assert!(!op.run_now);
        assert!(op.admit(2_001).is_err());
    }

    #[test]
    fn test_hold_and_resume() {
        let mut op = op(&["/a"]);
        op.hold().unwrap();
        assert_eq!(op.status, OperationStatus::Paused);
        op.resume(2_000).unwrap();
        assert_eq!(op.status, OperationStatus::Queued);

        op.scheduled_at = Some(10_000);
        op.hold().unwrap();
        op.resume(2_000).unwrap();
        assert_eq!(op.status, OperationStatus::Scheduled);

        assert!(op.resume(2_000).is_err());
    }

    #[test]
    fn test_boost() {
        let mut op = op(&["/a"]);
        op.status = OperationStatus::Scheduled;
        op.boost().unwrap();
        assert_eq!(op.status, OperationStatus::Queued);
        assert!(op.run_now);

        op.status = OperationStatus::Completed;
        assert!(matches!(op.boost(), Err(QueueError::InvalidTransition { .. })));
    }

    #[test]
    fn test_cancel_idle() {
        let mut op = op(&["/a"]);
        op.cancel_idle(3_000).unwrap();
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert_eq!(op.completed_at, Some(3_000));

        // Terminal is a no-op
        op.cancel_idle(4_000).unwrap();
        assert_eq!(op.completed_at, Some(3_000));

        op.status = OperationStatus::Running;
        assert!(op.cancel_idle(4_000).is_err());
    }

    #[test]
    fn test_requeue_resets_budget_keeps_history() {
        let mut op = op(&["/a"]);
        op.status = OperationStatus::Failed;
        op.current_attempt = 3;
        op.error_message = Some("boom".to_string());
        op.retry_attempts.push(AttemptRecord {
            attempt_number: 3,
            started_at: 1,
            ended_at: 2,
            error: "boom".to_string(),
        });
        op.record_results(vec![ItemResult::failed("/a", "boom")]);

        op.requeue().unwrap();
        assert_eq!(op.status, OperationStatus::Queued);
        assert_eq!(op.current_attempt, 0);
        assert!(op.error_message.is_none());
        assert_eq!(op.retry_attempts.len(), 1);
        assert!(op.results.is_empty());

        assert!(op.requeue().is_err());
    }

    #[test]
    fn test_interrupt() {
        let mut op = op(&["/a", "/b"]);
        op.admit(2_000).unwrap();
        op.record_results(vec![ItemResult::ok("/a")]);
        op.interrupt(3_000).unwrap();

        assert_eq!(op.status, OperationStatus::Queued);
        assert_eq!(op.current_attempt, 0);
        assert_eq!(op.processed_count, 0);
        assert_eq!(op.retry_attempts.len(), 1);
        assert_eq!(op.retry_attempts[0].error, INTERRUPTED_ERROR);
        assert_eq!(op.retry_attempts[0].started_at, 2_000);
    }

    #[test]
    fn test_filter_matches() {
        let mut op = op(&["/a"]);
        op.tags.push("photos".to_string());

        assert!(OperationFilter::all().matches(&op));
        assert!(OperationFilter::with_status(OperationStatus::Queued).matches(&op));
        assert!(!OperationFilter::with_status(OperationStatus::Failed).matches(&op));

        let filter = OperationFilter {
            operation_type: Some(OperationType::Move),
            ..Default::default()
        };
        assert!(!filter.matches(&op));

        let filter = OperationFilter {
            tag: Some("photos".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&op));
    }

    #[test]
    fn test_indexed_fields() {
        let op = op(&["/a"]);
        let fields = op.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::String("queued".to_string())));
        assert_eq!(fields.get("priority"), Some(&IndexValue::Int(1)));
    }
}
