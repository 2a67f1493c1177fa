//! OperationStore - actor that owns the storage backend
//!
//! Every read and write goes through one command channel, so updates are
//! linearizable per id (and across ids). Mutators run inside the actor on a
//! copy of the record; the copy replaces the stored record only after the
//! backend accepted it.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{Operation, OperationFilter, now_ms};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent};

use super::backend::StorageBackend;
use super::messages::{Mutator, Reply, StoreCommand};

/// Handle to send commands to the OperationStore
#[derive(Clone)]
pub struct OperationStore {
    tx: mpsc::Sender<StoreCommand>,
    events: EventBus,
}

impl OperationStore {
    /// Load the backend and spawn the actor
    pub fn spawn<B: StorageBackend>(mut backend: B, events: EventBus, durable: bool) -> eyre::Result<Self> {
        debug!(durable, "OperationStore::spawn: called");
        backend.set_durable(durable);
        let count = backend.load()?;
        let next_seq = backend
            .list(&OperationFilter::all())?
            .iter()
            .map(|op| op.seq)
            .max()
            .map_or(1, |seq| seq + 1);
        info!(count, next_seq, "Loaded operations");

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(Box::new(backend), rx, events.clone(), next_seq));

        info!("OperationStore spawned");
        Ok(Self { tx, events })
    }

    /// Event bus the actor emits on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> StoreCommand) -> QueueResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| QueueError::ChannelError)?;
        reply_rx.await.map_err(|_| QueueError::ChannelError)?
    }

    /// Store a new operation; the store assigns its submission order
    pub async fn add(&self, operation: Operation) -> QueueResult<Operation> {
        debug!(id = %operation.id, status = %operation.status, "add: called");
        self.request(|reply| StoreCommand::Add { operation, reply }).await
    }

    /// Get an operation by ID
    pub async fn get(&self, id: &str) -> QueueResult<Option<Operation>> {
        debug!(%id, "get: called");
        let id = id.to_string();
        self.request(|reply| StoreCommand::Get { id, reply }).await
    }

    /// Get an operation by ID, returning error if not found
    pub async fn get_required(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "get_required: called");
        self.get(id).await?.ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// List operations ordered by creation time
    pub async fn list(&self, filter: OperationFilter) -> QueueResult<Vec<Operation>> {
        debug!(?filter, "list: called");
        self.request(|reply| StoreCommand::List { filter, reply }).await
    }

    /// Atomically change one operation and return the stored result
    pub async fn update<F>(&self, id: &str, mutator: F) -> QueueResult<Operation>
    where
        F: FnOnce(&mut Operation) -> QueueResult<()> + Send + 'static,
    {
        debug!(%id, "update: called");
        let id = id.to_string();
        let mutator: Mutator = Box::new(mutator);
        self.request(|reply| StoreCommand::Update { id, mutator, reply }).await
    }

    /// Delete an operation and return its last state
    pub async fn remove(&self, id: &str) -> QueueResult<Operation> {
        debug!(%id, "remove: called");
        let id = id.to_string();
        self.request(|reply| StoreCommand::Remove { id, reply }).await
    }

    /// Delete every matching operation and return the removed IDs
    pub async fn remove_where(&self, filter: OperationFilter) -> QueueResult<Vec<String>> {
        debug!(?filter, "remove_where: called");
        self.request(|reply| StoreCommand::RemoveWhere { filter, reply }).await
    }

    /// Switch between fsync-per-write and deferred flushing
    pub async fn set_durable(&self, durable: bool) -> QueueResult<()> {
        debug!(durable, "set_durable: called");
        self.request(|reply| StoreCommand::SetDurable { durable, reply }).await
    }

    /// Make deferred writes durable
    pub async fn flush(&self) -> QueueResult<()> {
        debug!("flush: called");
        self.request(|reply| StoreCommand::Flush { reply }).await
    }

    /// Flush and stop the actor, releasing the backend
    ///
    /// Every later request on any handle fails with `ChannelError`.
    pub async fn close(&self) -> QueueResult<()> {
        debug!("close: called");
        self.request(|reply| StoreCommand::Close { reply }).await
    }
}

fn persistence(e: eyre::Report) -> QueueError {
    QueueError::Persistence(format!("{:#}", e))
}

/// Event describing the difference between two versions of an operation
fn change_event(before: &Operation, after: &Operation) -> Option<QueueEvent> {
    if before.status != after.status {
        return Some(QueueEvent::StatusChanged {
            id: after.id.clone(),
            from: before.status,
            to: after.status,
        });
    }
    if before.processed_count != after.processed_count || before.current_item != after.current_item {
        return Some(QueueEvent::Progress {
            id: after.id.clone(),
            processed_count: after.processed_count,
            failed_count: after.failed_count,
            items_count: after.items_count,
            current_item: after.current_item.clone(),
        });
    }
    None
}

fn apply_update(backend: &mut dyn StorageBackend, id: &str, mutator: Mutator) -> QueueResult<(Operation, Operation)> {
    let before = backend
        .get(id)
        .map_err(persistence)?
        .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

    let mut after = before.clone();
    mutator(&mut after)?;
    if after == before {
        debug!(%id, "apply_update: no change");
        return Ok((before, after));
    }

    after.updated_at = now_ms().max(before.updated_at);
    backend.put(&after).map_err(persistence)?;
    Ok((before, after))
}

async fn actor_loop(
    mut backend: Box<dyn StorageBackend>,
    mut rx: mpsc::Receiver<StoreCommand>,
    events: EventBus,
    mut next_seq: u64,
) {
    debug!(next_seq, "OperationStore actor started");

    while let Some(cmd) = rx.recv().await {
        debug!(command = cmd.name(), "actor_loop: command");
        match cmd {
            StoreCommand::Add { mut operation, reply } => {
                operation.seq = next_seq;
                let result = match backend.get(&operation.id) {
                    Ok(Some(_)) => Err(QueueError::Persistence(format!(
                        "operation {} already exists",
                        operation.id
                    ))),
                    Ok(None) => backend.put(&operation).map(|_| operation).map_err(persistence),
                    Err(e) => Err(persistence(e)),
                };
                if let Ok(op) = &result {
                    next_seq += 1;
                    events.emit(QueueEvent::Submitted {
                        id: op.id.clone(),
                        operation_type: op.operation_type,
                        status: op.status,
                    });
                }
                let _ = reply.send(result);
            }

            StoreCommand::Get { id, reply } => {
                let _ = reply.send(backend.get(&id).map_err(persistence));
            }

            StoreCommand::List { filter, reply } => {
                let _ = reply.send(backend.list(&filter).map_err(persistence));
            }

            StoreCommand::Update { id, mutator, reply } => {
                let result = apply_update(backend.as_mut(), &id, mutator).map(|(before, after)| {
                    if let Some(event) = change_event(&before, &after) {
                        events.emit(event);
                    }
                    after
                });
                if let Err(e) = &result {
                    debug!(%id, error = %e, "actor_loop: update rejected");
                }
                let _ = reply.send(result);
            }

            StoreCommand::Remove { id, reply } => {
                let result = match backend.get(&id) {
                    Ok(Some(op)) => backend.delete(&id).map(|_| op).map_err(persistence),
                    Ok(None) => Err(QueueError::NotFound(id.clone())),
                    Err(e) => Err(persistence(e)),
                };
                if result.is_ok() {
                    events.emit(QueueEvent::Removed { id });
                }
                let _ = reply.send(result);
            }

            StoreCommand::RemoveWhere { filter, reply } => {
                let result = backend.list(&filter).map_err(persistence).and_then(|ops| {
                    let mut removed = Vec::with_capacity(ops.len());
                    for op in ops {
                        backend.delete(&op.id).map_err(persistence)?;
                        events.emit(QueueEvent::Removed { id: op.id.clone() });
                        removed.push(op.id);
                    }
                    Ok(removed)
                });
                let _ = reply.send(result);
            }

            StoreCommand::SetDurable { durable, reply } => {
                backend.set_durable(durable);
                let _ = reply.send(Ok(()));
            }

            StoreCommand::Flush { reply } => {
                let result = backend.flush().map_err(persistence);
                if let Err(e) = &result {
                    warn!(error = %e, "actor_loop: flush failed");
                }
                let _ = reply.send(result);
            }

            StoreCommand::Close { reply } => {
                let result = backend.flush().map_err(persistence);
                drop(backend);
                info!("OperationStore closed");
                let _ = reply.send(result);
                return;
            }
        }
    }

    // Last chance for deferred writes
    if let Err(e) = backend.flush() {
        warn!(error = %e, "OperationStore final flush failed");
    }
    debug!("OperationStore actor stopped");
}
