//! Worker pool - bounded set of running executors
//!
//! A slot is taken when the scheduler admits an operation and released when
//! the scheduler reaps the worker's completion message, which the worker
//! sends only after the operation's post-run state is stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Operation, OperationStatus, now_ms};
use crate::error::{ExecutionError, QueueError};
use crate::executor::{ExecutionContext, Executor, ExecutorRegistry, ProgressUpdate};
use crate::state::OperationStore;

use super::retry::{RetryManager, RunOutcome};

const FINAL_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);
const FINAL_WRITE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Why a running operation was asked to stop; the strongest request wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopReason {
    Shutdown,
    Pause,
    Cancel,
}

/// Stop signal for one running operation
#[derive(Debug, Default)]
pub struct RunControl {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stop request and trip the executor's checkpoint
    pub fn request(&self, reason: StopReason) {
        let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_none_or(|existing| reason > existing) {
            *current = Some(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Stop controls of running operations, keyed by operation id
pub type RunControls = Arc<DashMap<String, Arc<RunControl>>>;

/// Bounded pool of worker tasks
pub struct WorkerPool {
    store: OperationStore,
    registry: Arc<ExecutorRegistry>,
    controls: RunControls,
    retry: RetryManager,
    workers: HashMap<String, JoinHandle<()>>,
    done_tx: mpsc::UnboundedSender<String>,
}

impl WorkerPool {
    /// Create a pool; completion messages arrive on the returned receiver
    pub fn new(
        store: OperationStore,
        registry: Arc<ExecutorRegistry>,
        controls: RunControls,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let pool = Self {
            store,
            registry,
            controls,
            retry: RetryManager::new(),
            workers: HashMap::new(),
            done_tx,
        };
        (pool, done_rx)
    }

    /// Occupied slots
    pub fn active(&self) -> usize {
        self.workers.len()
    }

    pub fn has_free_slot(&self, max_parallel: usize) -> bool {
        self.workers.len() < max_parallel
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    /// Register a stop control before the operation is admitted
    pub fn prepare(&self, id: &str) -> Arc<RunControl> {
        let control = Arc::new(RunControl::new());
        self.controls.insert(id.to_string(), control.clone());
        control
    }

    /// Drop a control whose admission did not happen
    pub fn abandon(&self, id: &str) {
        self.controls.remove(id);
    }

    /// Start a worker for an operation that was just admitted
    pub fn spawn(&mut self, op: Operation, control: Arc<RunControl>, progress_interval: Duration) {
        debug!(id = %op.id, attempt = op.current_attempt, "WorkerPool::spawn: called");
        let id = op.id.clone();
        let worker = Worker {
            executor: self.registry.get(op.operation_type),
            store: self.store.clone(),
            controls: self.controls.clone(),
            control,
            retry: self.retry,
            progress_interval,
            done_tx: self.done_tx.clone(),
        };
        let handle = tokio::spawn(worker.run(op));
        self.workers.insert(id, handle);
    }

    /// Release the slot of a worker that reported completion
    pub fn reap(&mut self, id: &str) {
        if self.workers.remove(id).is_some() {
            debug!(%id, "WorkerPool::reap: slot released");
        }
    }

    /// Ask every running operation to stop
    pub fn signal_all(&self, reason: StopReason) {
        for id in self.workers.keys() {
            if let Some(control) = self.controls.get(id) {
                control.request(reason);
            }
        }
    }

    /// Wait for every worker to finish; false if the deadline passed first
    pub async fn wait_all(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let ids: Vec<String> = self.workers.keys().cloned().collect();
        for id in ids {
            if let Some(handle) = self.workers.get_mut(&id) {
                match tokio::time::timeout_at(deadline, handle).await {
                    Ok(Err(e)) => error!(%id, error = %e, "Worker task failed"),
                    Ok(Ok(())) => {}
                    Err(_) => return false,
                }
                self.workers.remove(&id);
            }
        }
        true
    }

    /// Abort whatever is still running; the store keeps those operations `running`
    pub fn abort_all(&mut self) {
        for (id, handle) in self.workers.drain() {
            warn!(%id, "Aborting worker that ignored the stop request");
            handle.abort();
            self.controls.remove(&id);
        }
    }
}

/// One admitted operation being executed
struct Worker {
    executor: Option<Arc<dyn Executor>>,
    store: OperationStore,
    controls: RunControls,
    control: Arc<RunControl>,
    retry: RetryManager,
    progress_interval: Duration,
    done_tx: mpsc::UnboundedSender<String>,
}

impl Worker {
    async fn run(self, op: Operation) {
        let id = op.id.clone();
        info!(%id, operation_type = %op.operation_type, attempt = op.current_attempt, "Operation started");

        let outcome = match self.executor.clone() {
            Some(executor) => self.execute(executor, &op).await,
            None => RunOutcome::NoExecutor,
        };

        self.settle(&id, outcome).await;
        self.controls.remove(&id);
        let _ = self.done_tx.send(id);
    }

    async fn execute(&self, executor: Arc<dyn Executor>, op: &Operation) -> RunOutcome {
        let (ctx, mut progress_rx) = ExecutionContext::new(
            op.id.clone(),
            op.operation_type,
            op.remaining_items(),
            op.params.clone(),
            op.current_attempt,
            self.control.token(),
        );
        debug!(id = %op.id, executor = executor.name(), items = ctx.items().len(), "Worker::execute: called");

        // Own task so a panicking executor cannot take the slot down with it
        let mut task = tokio::spawn(async move { executor.execute(&ctx).await });

        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let base = (op.processed_count, op.failed_count);

        let result = loop {
            tokio::select! {
                joined = &mut task => {
                    break joined.unwrap_or_else(|e| Err(ExecutionError::Panicked(e.to_string())));
                }
                _ = ticker.tick() => {
                    if progress_rx.has_changed().unwrap_or(false) {
                        let update = progress_rx.borrow_and_update().clone();
                        if let Some(update) = update {
                            self.write_progress(&op.id, base, update).await;
                        }
                    }
                }
            }
        };

        match result {
            Ok(results) => RunOutcome::Finished(results),
            Err(e) => RunOutcome::Failed(e),
        }
    }

    async fn write_progress(&self, id: &str, base: (u32, u32), update: ProgressUpdate) {
        let result = self
            .store
            .update(id, move |op| {
                if op.status != OperationStatus::Running {
                    return Ok(());
                }
                op.processed_count = (base.0 + update.processed).min(op.items_count);
                op.failed_count = (base.1 + update.failed).min(op.processed_count);
                op.current_item = update.current_item;
                op.bytes_processed = update.bytes_processed;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            debug!(%id, error = %e, "Worker::write_progress: discarded");
        }
    }

    /// Store the post-run state in one update
    ///
    /// The slot stays taken until this returns; a failing backend is retried
    /// with capped backoff. Shutdown aborts a worker stuck here.
    async fn settle(&self, id: &str, outcome: RunOutcome) {
        let mut delay = FINAL_WRITE_RETRY_DELAY;
        for attempt in 1u32.. {
            let control = self.control.clone();
            let retry = self.retry;
            let outcome = outcome.clone();
            let now = now_ms();
            let result = self
                .store
                .update(id, move |op| {
                    if op.status == OperationStatus::Running {
                        // Read inside the actor so a concurrent cancel is never lost
                        retry.settle(op, outcome, control.reason(), now);
                    }
                    Ok(())
                })
                .await;

            match result {
                Ok(op) => {
                    debug!(%id, status = %op.status, attempt, "Worker::settle: stored");
                    return;
                }
                Err(QueueError::NotFound(_)) => {
                    info!(%id, "Operation removed while running; result discarded");
                    return;
                }
                Err(QueueError::Persistence(e)) => {
                    warn!(
                        %id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to store run result, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(FINAL_WRITE_MAX_DELAY);
                }
                Err(e) => {
                    error!(%id, error = %e, "Store closed before the run result was stored");
                    return;
                }
            }
        }
    }
}
