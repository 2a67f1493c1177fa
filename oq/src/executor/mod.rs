//! Executor contract and registry
//!
//! The engine never performs file I/O itself. Each operation type is bound
//! to an [`Executor`] that receives an [`ExecutionContext`] and returns one
//! [`ItemResult`](crate::domain::ItemResult) per processed item.

mod context;
mod dry_run;
mod registry;
mod traits;

pub use context::{Checkpoint, ExecutionContext, ProgressUpdate};
pub use dry_run::DryRunExecutor;
pub use registry::ExecutorRegistry;
pub use traits::Executor;
