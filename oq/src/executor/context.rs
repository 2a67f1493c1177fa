//! Per-run context handed to an executor

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::OperationType;
use crate::error::ExecutionError;

/// Answer from [`ExecutionContext::checkpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    /// Cancel, pause or shutdown was requested; return the results so far
    Stop,
}

/// Progress snapshot for the current run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Items finished in this run
    pub processed: u32,
    /// Of those, items that failed
    pub failed: u32,
    pub current_item: Option<String>,
    pub bytes_processed: u64,
}

/// What an executor sees of the operation it runs
pub struct ExecutionContext {
    operation_id: String,
    operation_type: OperationType,
    items: Vec<String>,
    params: Value,
    attempt: u32,
    token: CancellationToken,
    progress_tx: watch::Sender<Option<ProgressUpdate>>,
}

impl ExecutionContext {
    /// Build a context; the receiver observes the latest reported progress
    pub fn new(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        items: Vec<String>,
        params: Value,
        attempt: u32,
        token: CancellationToken,
    ) -> (Self, watch::Receiver<Option<ProgressUpdate>>) {
        let (progress_tx, progress_rx) = watch::channel(None);
        let ctx = Self {
            operation_id: operation_id.into(),
            operation_type,
            items,
            params,
            attempt,
            token,
            progress_tx,
        };
        (ctx, progress_rx)
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// Items to process in this run (excludes items finished before a pause)
    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Deserialize the parameters into an executor-specific type
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, ExecutionError> {
        serde_json::from_value(self.params.clone()).map_err(|e| ExecutionError::InvalidParams(e.to_string()))
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Call between items
    pub fn checkpoint(&self) -> Checkpoint {
        if self.token.is_cancelled() {
            Checkpoint::Stop
        } else {
            Checkpoint::Continue
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop is requested
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Publish progress; the worker coalesces writes to the store
    pub fn report_progress(&self, update: ProgressUpdate) {
        self.progress_tx.send_replace(Some(update));
    }
}
