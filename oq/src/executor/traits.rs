//! Executor trait

use async_trait::async_trait;

use crate::domain::ItemResult;
use crate::error::ExecutionError;

use super::ExecutionContext;

/// Performs the actual work for one operation type
///
/// Implementations process `ctx.items()` in order and call
/// [`ExecutionContext::checkpoint`] between items; when it says stop they
/// return the results gathered so far. Item-level failures belong in the
/// returned results; `Err` means the run as a whole failed and is subject
/// to the retry policy.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Vec<ItemResult>, ExecutionError>;
}
