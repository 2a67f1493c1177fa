//! Scheduler for operation execution
//!
//! A single control loop promotes due scheduled operations and admits queued
//! ones into a bounded worker pool by priority. Workers settle each run
//! through the retry manager in one atomic store update.

mod config;
mod core;
mod pool;
mod queue;
mod retry;

pub use config::{ConfigManager, ConfigUpdate};
pub use core::{CycleReport, Scheduler};
pub use pool::{RunControl, RunControls, StopReason, WorkerPool};
pub use queue::DispatchCandidate;
pub use retry::{RetryManager, RunOutcome};
