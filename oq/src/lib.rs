//! opqueue - prioritized file-operation queue with persistence and retries
//!
//! Callers submit batches of file operations (copy, move, delete, archive,
//! batch rename, ...). A scheduler admits them into a bounded worker pool by
//! priority, retries failures with backoff, and persists every state change
//! so the queue survives a restart.
//!
//! # Modules
//!
//! - [`domain`] - Operation records, status machine, priorities and retry policies
//! - [`state`] - Serialized operation store over a pluggable backend
//! - [`scheduler`] - Admission loop, worker pool and retry settlement
//! - [`executor`] - Executor contract and registry
//! - [`events`] - Change notifications for UI layers
//! - [`service`] - The [`OperationQueue`] facade
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod stats;

// Re-export commonly used types
pub use config::{Config, QueueConfig, RetryConfig, ShutdownConfig, ShutdownPolicy, StorageConfig};
pub use domain::{
    AttemptRecord, BackoffPolicy, BackoffStrategy, ItemResult, Operation, OperationFilter, OperationSpec,
    OperationStatus, OperationType, Priority, RetryPolicy,
};
pub use error::{ExecutionError, QueueError, QueueResult};
pub use events::{EventBus, QueueEvent};
pub use executor::{Checkpoint, DryRunExecutor, ExecutionContext, Executor, ExecutorRegistry, ProgressUpdate};
pub use scheduler::{ConfigUpdate, Scheduler};
pub use service::OperationQueue;
pub use state::{MemoryBackend, OperationStore, RecoveryStats, StorageBackend, TaskStoreBackend};
pub use stats::Statistics;
