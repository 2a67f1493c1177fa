//! Domain types for opqueue
//!
//! Operation records, their status machine, priorities and retry policies.
//! `Operation` implements the taskstore `Record` trait for persistence.

mod id;
mod operation;
mod priority;
mod retry;

pub use id::{generate_id, matching_ids};
pub use operation::{
    AttemptRecord, INTERRUPTED_ERROR, ItemResult, Operation, OperationFilter, OperationSpec, OperationStatus,
    OperationType,
};
pub use priority::Priority;
pub use retry::{BackoffPolicy, BackoffStrategy, MAX_BACKOFF_DELAY_MS, RetryPolicy};

// Re-export taskstore types for convenience
pub use taskstore::{Filter, FilterOp, IndexValue, Record, Store, now_ms};
