//! Scheduler implementation

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, ShutdownConfig, ShutdownPolicy};
use crate::domain::{OperationFilter, OperationStatus, now_ms};
use crate::error::{QueueError, QueueResult};
use crate::executor::ExecutorRegistry;
use crate::state::OperationStore;

use super::pool::{RunControls, StopReason, WorkerPool};
use super::queue::DispatchCandidate;

/// What one scheduling cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub promoted: usize,
    pub dispatched: usize,
}

/// The control loop: promotes due operations and admits queued ones
pub struct Scheduler {
    store: OperationStore,
    pool: WorkerPool,
    done_rx: mpsc::UnboundedReceiver<String>,
    config_rx: watch::Receiver<QueueConfig>,
    shutdown_config: ShutdownConfig,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    durable: bool,
    next_due: Option<i64>,
}

impl Scheduler {
    /// Create a scheduler with the given collaborators
    pub fn new(
        store: OperationStore,
        registry: Arc<ExecutorRegistry>,
        controls: RunControls,
        config_rx: watch::Receiver<QueueConfig>,
        shutdown_config: ShutdownConfig,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        debug!(?shutdown_config, "Scheduler::new: called");
        let durable = config_rx.borrow().persist_on_change;
        let (pool, done_rx) = WorkerPool::new(store.clone(), registry, controls);
        Self {
            store,
            pool,
            done_rx,
            config_rx,
            shutdown_config,
            wake,
            shutdown,
            durable,
            next_due: None,
        }
    }

    /// Occupied worker slots
    pub fn active(&self) -> usize {
        self.pool.active()
    }

    /// Run until the shutdown token fires, then stop per the shutdown policy
    pub async fn run(mut self) {
        info!("Scheduler started");

        loop {
            match self.run_cycle().await {
                Ok(report) if report != CycleReport::default() => {
                    debug!(?report, active = self.pool.active(), "Scheduler::run: cycle");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Scheduling cycle failed"),
            }

            let wait = self.next_wait(now_ms());
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Scheduler::run: shutdown requested");
                    break;
                }
                Some(id) = self.done_rx.recv() => {
                    self.pool.reap(&id);
                    // Reap everything already finished before the next cycle
                    while let Ok(id) = self.done_rx.try_recv() {
                        self.pool.reap(&id);
                    }
                }
                _ = self.wake.notified() => {
                    debug!("Scheduler::run: woken");
                }
                _ = tokio::time::sleep(wait) => {
                    debug!("Scheduler::run: tick");
                }
            }
        }

        self.stop().await;
        info!("Scheduler stopped");
    }

    /// Promote, dispatch, and flush deferred writes
    pub async fn run_cycle(&mut self) -> QueueResult<CycleReport> {
        let config = self.config_rx.borrow_and_update().clone();
        if config.persist_on_change != self.durable {
            self.store.set_durable(config.persist_on_change).await?;
            self.durable = config.persist_on_change;
        }

        let now = now_ms();
        let promoted = self.promote(now).await?;
        let dispatched = self.dispatch(&config).await?;

        if !self.durable {
            self.store.flush().await?;
        }
        Ok(CycleReport { promoted, dispatched })
    }

    /// Move every due scheduled operation to queued and remember the next due time
    async fn promote(&mut self, now: i64) -> QueueResult<usize> {
        let scheduled = self
            .store
            .list(OperationFilter::with_status(OperationStatus::Scheduled))
            .await?;

        let mut promoted = 0;
        self.next_due = None;
        for op in scheduled {
            if op.is_due(now) {
                match self.store.update(&op.id, |op| op.promote()).await {
                    Ok(_) => {
                        debug!(id = %op.id, "Scheduler::promote: promoted");
                        promoted += 1;
                    }
                    // Paused, cancelled or removed since the listing
                    Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            } else if let Some(at) = op.scheduled_at {
                self.next_due = Some(self.next_due.map_or(at, |due| due.min(at)));
            }
        }
        Ok(promoted)
    }

    /// Admit queued operations into free slots in dispatch order
    async fn dispatch(&mut self, config: &QueueConfig) -> QueueResult<usize> {
        if !self.pool.has_free_slot(config.max_parallel_operations) {
            return Ok(0);
        }

        let queued = self
            .store
            .list(OperationFilter::with_status(OperationStatus::Queued))
            .await?;
        let mut candidates: BinaryHeap<DispatchCandidate> = queued.into_iter().map(DispatchCandidate::from).collect();

        let progress_interval = Duration::from_millis(config.progress_interval_ms);
        let mut dispatched = 0;
        while self.pool.has_free_slot(config.max_parallel_operations) {
            let Some(candidate) = candidates.pop() else {
                break;
            };
            let id = candidate.id;
            let control = self.pool.prepare(&id);
            let now = now_ms();

            match self.store.update(&id, move |op| op.admit(now)).await {
                Ok(op) => {
                    debug!(%id, priority = %op.priority, run_now = candidate.run_now, "Scheduler::dispatch: admitted");
                    self.pool.spawn(op, control, progress_interval);
                    dispatched += 1;
                }
                Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {
                    self.pool.abandon(&id);
                }
                Err(e) => {
                    self.pool.abandon(&id);
                    return Err(e);
                }
            }
        }
        Ok(dispatched)
    }

    /// Sleep until the next tick, or the next scheduled time if that is sooner
    fn next_wait(&self, now: i64) -> Duration {
        let tick = Duration::from_secs(self.config_rx.borrow().check_scheduled_interval_sec);
        match self.next_due {
            Some(due) => {
                let until_due = Duration::from_millis(due.saturating_sub(now).max(0) as u64);
                tick.min(until_due)
            }
            None => tick,
        }
    }

    /// Stop admission and bring in-flight operations down per the shutdown policy
    async fn stop(&mut self) {
        let timeout = Duration::from_secs(self.shutdown_config.timeout_secs);
        info!(
            policy = ?self.shutdown_config.policy,
            in_flight = self.pool.active(),
            "Scheduler stopping"
        );

        if self.shutdown_config.policy == ShutdownPolicy::Drain && self.pool.wait_all(timeout).await {
            debug!("Scheduler::stop: drained");
        } else {
            self.pool.signal_all(StopReason::Shutdown);
            if !self.pool.wait_all(timeout).await {
                self.pool.abort_all();
            }
        }

        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Final flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Operation, OperationSpec, OperationType, RetryPolicy};
    use crate::events::EventBus;
    use crate::state::MemoryBackend;
    use dashmap::DashMap;

    fn scheduler(store: OperationStore, max_parallel: usize) -> (Scheduler, watch::Sender<QueueConfig>) {
        let config = QueueConfig {
            max_parallel_operations: max_parallel,
            ..QueueConfig::default()
        };
        let (tx, rx) = watch::channel(config);
        let scheduler = Scheduler::new(
            store,
            Arc::new(ExecutorRegistry::new()),
            Arc::new(DashMap::new()),
            rx,
            ShutdownConfig::default(),
            Arc::new(Notify::new()),
            CancellationToken::new(),
        );
        (scheduler, tx)
    }

    fn op(scheduled_at: Option<i64>, now: i64) -> Operation {
        let mut spec = OperationSpec::new(OperationType::Copy, vec!["/a".to_string()]);
        if let Some(at) = scheduled_at {
            spec = spec.scheduled_at(at);
        }
        Operation::from_spec(spec, RetryPolicy::default(), now)
    }

    #[tokio::test]
    async fn test_cycle_promotes_and_fills_slots() {
        let store = OperationStore::spawn(MemoryBackend::new(), EventBus::default(), true).unwrap();
        let now = now_ms();

        let mut overdue = op(Some(now + 60_000), now);
        overdue.scheduled_at = Some(now - 1);
        store.add(overdue).await.unwrap();
        store.add(op(None, now)).await.unwrap();
        store.add(op(None, now)).await.unwrap();
        store.add(op(Some(now + 60_000), now)).await.unwrap();

        let (mut scheduler, _tx) = scheduler(store, 2);
        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                promoted: 1,
                dispatched: 2
            }
        );
        assert_eq!(scheduler.active(), 2);
        assert_eq!(scheduler.next_due, Some(now + 60_000));
    }

    #[tokio::test]
    async fn test_cycle_without_free_slot_dispatches_nothing() {
        let store = OperationStore::spawn(MemoryBackend::new(), EventBus::default(), true).unwrap();
        let now = now_ms();
        for _ in 0..3 {
            store.add(op(None, now)).await.unwrap();
        }

        let (mut scheduler, _tx) = scheduler(store, 1);
        assert_eq!(scheduler.run_cycle().await.unwrap().dispatched, 1);
        assert_eq!(scheduler.run_cycle().await.unwrap().dispatched, 0);
    }

    #[tokio::test]
    async fn test_next_wait_prefers_sooner_due_time() {
        let store = OperationStore::spawn(MemoryBackend::new(), EventBus::default(), true).unwrap();
        let (mut scheduler, _tx) = scheduler(store, 1);

        assert_eq!(scheduler.next_wait(1_000), Duration::from_secs(60));
        scheduler.next_due = Some(1_500);
        assert_eq!(scheduler.next_wait(1_000), Duration::from_millis(500));
        scheduler.next_due = Some(500);
        assert_eq!(scheduler.next_wait(1_000), Duration::ZERO);
    }
}
