//! OperationQueue - the explicitly owned queue service
//!
//! Construct with [`OperationQueue::open`] (or [`OperationQueue::with_backend`]),
//! register executors, then [`start`](OperationQueue::start) the scheduler.
//! The client API works whether or not the scheduler runs; without it,
//! nothing is admitted. After [`shutdown`](OperationQueue::shutdown) the
//! store is closed and every call returns `ShuttingDown`.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use eyre::Context;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, QueueConfig, QueueMode, ShutdownConfig};
use crate::domain::{Operation, OperationFilter, OperationSpec, OperationStatus, OperationType, RetryPolicy, Store, now_ms};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent};
use crate::executor::{Executor, ExecutorRegistry};
use crate::scheduler::{ConfigManager, ConfigUpdate, RunControls, Scheduler, StopReason};
use crate::state::{OperationStore, RecoveryStats, StorageBackend, TaskStoreBackend, recover};
use crate::stats::{self, Statistics};

/// Statuses removed by [`OperationQueue::clear_completed`]
const CLEARABLE: [OperationStatus; 3] = [
    OperationStatus::Completed,
    OperationStatus::Failed,
    OperationStatus::Cancelled,
];

/// The queue engine and its client API
pub struct OperationQueue {
    store: OperationStore,
    registry: Arc<ExecutorRegistry>,
    config: ConfigManager,
    mode: QueueMode,
    default_retry: RetryPolicy,
    shutdown_config: ShutdownConfig,
    controls: RunControls,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    recovery: RecoveryStats,
}

impl OperationQueue {
    /// Open the durable store named by the configuration and reconcile leftovers
    pub async fn open(config: &Config) -> eyre::Result<Self> {
        let path = config.storage.store_path();
        debug!(path = %path.display(), "OperationQueue::open: called");
        let store = Store::open(&path).wrap_err_with(|| format!("Failed to open store at {}", path.display()))?;
        let backend = TaskStoreBackend::new(store).with_compaction(config.storage.compact_on_open);
        Self::with_backend(backend, config).await
    }

    /// Build the queue on an explicit storage backend
    pub async fn with_backend<B: StorageBackend>(backend: B, config: &Config) -> eyre::Result<Self> {
        debug!("OperationQueue::with_backend: called");
        config.validate()?;
        let manager = ConfigManager::new(config.queue.clone())?;
        let store = OperationStore::spawn(backend, EventBus::default(), config.queue.persist_on_change)?;
        let recovery = recover(&store).await?;
        info!(%recovery, "Operation queue opened");

        Ok(Self {
            store,
            registry: Arc::new(ExecutorRegistry::new()),
            config: manager,
            mode: config.mode,
            default_retry: config.default_retry_policy(),
            shutdown_config: config.shutdown.clone(),
            controls: Arc::new(DashMap::new()),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            scheduler: Mutex::new(None),
            recovery,
        })
    }

    /// What restart reconciliation found
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Bind an executor to an operation type
    pub fn register(&self, operation_type: OperationType, executor: Arc<dyn Executor>) {
        self.registry.register(operation_type, executor);
    }

    /// Spawn the scheduler task; a no-op if it already runs
    pub fn start(&self) -> QueueResult<()> {
        debug!("OperationQueue::start: called");
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            debug!("OperationQueue::start: already running");
            return Ok(());
        }

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.registry.clone(),
            self.controls.clone(),
            self.config.subscribe(),
            self.shutdown_config.clone(),
            self.wake.clone(),
            self.shutdown.clone(),
        );
        *slot = Some(tokio::spawn(scheduler.run()));
        info!("Operation queue started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.scheduler.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Stop admission, settle in-flight work per the shutdown policy, then
    /// flush and close the store, releasing its lock
    pub async fn shutdown(&self) -> QueueResult<()> {
        debug!("OperationQueue::shutdown: called");
        self.shutdown.cancel();
        let handle = self.scheduler.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
        match self.store.close().await {
            // Closed by an earlier call
            Ok(()) | Err(QueueError::ChannelError) => {}
            Err(e) => return Err(e),
        }
        info!("Operation queue shut down");
        Ok(())
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        Ok(())
    }

    /// Reject what the queue cannot honour before anything is stored
    fn check_spec(&self, spec: &OperationSpec) -> QueueResult<()> {
        if let Some(policy) = &spec.retry_policy {
            policy.validate()?;
        }
        if self.mode == QueueMode::Batch {
            if spec.scheduled_at.is_some() {
                return Err(QueueError::InvalidConfig(
                    "scheduled-at is not available in batch mode".to_string(),
                ));
            }
            if spec.retry_policy.is_some() {
                return Err(QueueError::InvalidConfig(
                    "retry policies are not available in batch mode".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn wake_scheduler(&self) {
        self.wake.notify_one();
    }

    /// Store a new operation and return its ID
    pub async fn submit(&self, spec: OperationSpec) -> QueueResult<String> {
        debug!(operation_type = %spec.operation_type, items = spec.items.len(), "submit: called");
        self.ensure_open()?;
        self.check_spec(&spec)?;
        let op = Operation::from_spec(spec, self.default_retry, now_ms());
        let op = self.store.add(op).await?;
        info!(id = %op.id, status = %op.status, priority = %op.priority, "Operation submitted");

        if self.config.current().auto_start {
            self.wake_scheduler();
        }
        Ok(op.id)
    }

    /// Cancel an operation
    ///
    /// Idle operations end `cancelled` at once; a running one is signalled and
    /// its worker records `cancelled`. Terminal operations are returned unchanged.
    pub async fn cancel(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "cancel: called");
        self.ensure_open()?;
        let controls = self.controls.clone();
        let now = now_ms();
        self.store
            .update(id, move |op| {
                if op.status != OperationStatus::Running {
                    return op.cancel_idle(now);
                }
                match controls.get(&op.id) {
                    Some(control) => control.request(StopReason::Cancel),
                    None => {
                        // No worker in this process owns it
                        op.status = OperationStatus::Cancelled;
                        op.completed_at = Some(now);
                    }
                }
                Ok(())
            })
            .await
    }

    /// Hold a queued or scheduled operation, or ask a running one to pause
    pub async fn pause(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "pause: called");
        self.ensure_open()?;
        let controls = self.controls.clone();
        self.store
            .update(id, move |op| {
                if op.status != OperationStatus::Running {
                    return op.hold();
                }
                match controls.get(&op.id) {
                    Some(control) => {
                        control.request(StopReason::Pause);
                        Ok(())
                    }
                    None => Err(QueueError::InvalidTransition {
                        id: op.id.clone(),
                        action: "pause",
                        status: op.status,
                    }),
                }
            })
            .await
    }

    /// Release a paused operation
    pub async fn resume(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "resume: called");
        self.ensure_open()?;
        let now = now_ms();
        let op = self.store.update(id, move |op| op.resume(now)).await?;
        self.wake_scheduler();
        Ok(op)
    }

    /// Requeue a failed or cancelled operation with a fresh attempt budget
    pub async fn retry(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "retry: called");
        self.ensure_open()?;
        let op = self.store.update(id, |op| op.requeue()).await?;
        self.wake_scheduler();
        Ok(op)
    }

    /// Admit an operation ahead of everything else, still within the slot limit
    pub async fn run_now(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "run_now: called");
        self.ensure_open()?;
        let op = self.store.update(id, |op| op.boost()).await?;
        self.wake_scheduler();
        Ok(op)
    }

    /// Delete an operation; a running one is cancelled and its late writes discarded
    pub async fn remove(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "remove: called");
        self.ensure_open()?;
        let op = self.store.remove(id).await?;
        // Admission happens before removal or not at all, so the control exists by now
        if let Some(control) = self.controls.get(id) {
            control.request(StopReason::Cancel);
        }
        info!(%id, status = %op.status, "Operation removed");
        Ok(op)
    }

    /// Remove every completed, failed and cancelled operation
    pub async fn clear_completed(&self) -> QueueResult<usize> {
        debug!("clear_completed: called");
        self.ensure_open()?;
        let removed = self.store.remove_where(OperationFilter::with_statuses(&CLEARABLE)).await?;
        info!(count = removed.len(), "Cleared finished operations");
        Ok(removed.len())
    }

    /// Validate and apply a partial configuration change
    pub async fn update_config(&self, update: ConfigUpdate) -> QueueResult<QueueConfig> {
        debug!(?update, "update_config: called");
        self.ensure_open()?;
        let applied = self.config.update(&update)?;
        self.store.events().emit(QueueEvent::ConfigUpdated {
            max_parallel_operations: applied.max_parallel_operations,
        });
        self.wake_scheduler();
        Ok(applied)
    }

    /// Retry policy given to submissions that carry none
    pub fn default_retry_policy(&self) -> RetryPolicy {
        self.default_retry
    }

    pub fn config(&self) -> QueueConfig {
        self.config.current()
    }

    pub async fn get(&self, id: &str) -> QueueResult<Operation> {
        self.ensure_open()?;
        self.store.get_required(id).await
    }

    pub async fn list(&self, filter: OperationFilter) -> QueueResult<Vec<Operation>> {
        self.ensure_open()?;
        self.store.list(filter).await
    }

    pub async fn statistics(&self) -> QueueResult<Statistics> {
        self.ensure_open()?;
        stats::collect(&self.store).await
    }

    /// Receive every committed change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.store.events().subscribe()
    }
}
