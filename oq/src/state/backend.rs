//! Storage backends for the operation store
//!
//! The actor talks to a [`StorageBackend`]; production uses a taskstore
//! [`Store`], tests can swap in [`MemoryBackend`] and make its writes fail.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::domain::{Filter, IndexValue, Operation, OperationFilter, Store};

/// Durable home of operation records
///
/// `put` and `delete` either take effect completely or return an error and
/// leave the stored state as it was.
pub trait StorageBackend: Send + 'static {
    /// Prepare the backend after open and return the number of stored operations
    fn load(&mut self) -> eyre::Result<usize>;

    fn get(&self, id: &str) -> eyre::Result<Option<Operation>>;

    /// Insert or replace
    fn put(&mut self, op: &Operation) -> eyre::Result<()>;

    /// Returns false if the id was unknown
    fn delete(&mut self, id: &str) -> eyre::Result<bool>;

    /// Matching operations ordered by `created_at`, then `seq`, then `id`
    fn list(&self, filter: &OperationFilter) -> eyre::Result<Vec<Operation>>;

    /// fsync each write (true) or defer to [`StorageBackend::flush`]
    fn set_durable(&mut self, durable: bool);

    fn flush(&mut self) -> eyre::Result<()>;
}

fn sort_operations(ops: &mut [Operation]) {
    ops.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.seq.cmp(&b.seq))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Production backend: JSONL log + SQLite index
pub struct TaskStoreBackend {
    store: Store,
    compact_on_load: bool,
}

impl TaskStoreBackend {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            compact_on_load: false,
        }
    }

    /// Rewrite the log down to one line per operation during [`StorageBackend::load`]
    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact_on_load = compact;
        self
    }
}

impl StorageBackend for TaskStoreBackend {
    fn load(&mut self) -> eyre::Result<usize> {
        debug!(path = %self.store.path().display(), "TaskStoreBackend::load: called");
        let count = self.store.rebuild_indexes::<Operation>()?;
        if self.compact_on_load {
            self.store.compact::<Operation>()?;
        }
        Ok(count)
    }

    fn get(&self, id: &str) -> eyre::Result<Option<Operation>> {
        self.store.get(id)
    }

    fn put(&mut self, op: &Operation) -> eyre::Result<()> {
        self.store.put(op)
    }

    fn delete(&mut self, id: &str) -> eyre::Result<bool> {
        self.store.delete::<Operation>(id)
    }

    fn list(&self, filter: &OperationFilter) -> eyre::Result<Vec<Operation>> {
        let mut filters = Vec::new();
        // Single values go to the index; sets and tags are matched in memory
        if let [status] = filter.statuses.as_slice() {
            filters.push(Filter::eq("status", IndexValue::String(status.as_str().to_string())));
        }
        if let Some(op_type) = filter.operation_type {
            filters.push(Filter::eq(
                "operation_type",
                IndexValue::String(op_type.as_str().to_string()),
            ));
        }

        let mut ops: Vec<Operation> = self.store.list(&filters)?;
        ops.retain(|op| filter.matches(op));
        sort_operations(&mut ops);
        Ok(ops)
    }

    fn set_durable(&mut self, durable: bool) {
        self.store.set_durable(durable);
    }

    fn flush(&mut self) -> eyre::Result<()> {
        self.store.flush()
    }
}

/// Non-durable backend
///
/// Holds operations in memory. Writes can be made to fail through the flag
/// returned by [`MemoryBackend::write_failures`].
#[derive(Default)]
pub struct MemoryBackend {
    ops: BTreeMap<String, Operation>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing operations, as if loaded from disk
    pub fn with_operations(ops: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            ops: ops.into_iter().map(|op| (op.id.clone(), op)).collect(),
            fail_writes: Arc::default(),
        }
    }

    /// While the flag is set every put/delete/flush returns an error
    pub fn write_failures(&self) -> Arc<AtomicBool> {
        self.fail_writes.clone()
    }

    fn check_writable(&self) -> eyre::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(eyre::eyre!("simulated storage failure"));
        }
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&mut self) -> eyre::Result<usize> {
        Ok(self.ops.len())
    }

    fn get(&self, id: &str) -> eyre::Result<Option<Operation>> {
        Ok(self.ops.get(id).cloned())
    }

    fn put(&mut self, op: &Operation) -> eyre::Result<()> {
        self.check_writable()?;
        self.ops.insert(op.id.clone(), op.clone());
        Ok(())
    }

    fn delete(&mut self, id: &str) -> eyre::Result<bool> {
        self.check_writable()?;
        Ok(self.ops.remove(id).is_some())
    }

    fn list(&self, filter: &OperationFilter) -> eyre::Result<Vec<Operation>> {
        let mut ops: Vec<Operation> = self.ops.values().filter(|op| filter.matches(op)).cloned().collect();
        sort_operations(&mut ops);
        Ok(ops)
    }

    fn set_durable(&mut self, _durable: bool) {}

    fn flush(&mut self) -> eyre::Result<()> {
        self.check_writable()
    }
}
