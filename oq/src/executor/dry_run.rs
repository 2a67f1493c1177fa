//! DryRunExecutor - reports every item as processed without touching the filesystem

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::{ItemResult, OperationType};
use crate::error::ExecutionError;

use super::{Checkpoint, ExecutionContext, Executor, ProgressUpdate};

/// Executor used by `oq run` and for exercising the engine end to end
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor {
    item_delay: Duration,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated time spent on each item
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }
}

/// Final path component, used for rename previews
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[async_trait]
impl Executor for DryRunExecutor {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Vec<ItemResult>, ExecutionError> {
        debug!(
            operation_id = ctx.operation_id(),
            items = ctx.items().len(),
            attempt = ctx.attempt(),
            "DryRunExecutor::execute: called"
        );
        let prefix = ctx.params().get("prefix").and_then(|v| v.as_str()).unwrap_or("");

        let mut results = Vec::with_capacity(ctx.items().len());
        for item in ctx.items() {
            if ctx.checkpoint() == Checkpoint::Stop {
                debug!(operation_id = ctx.operation_id(), "DryRunExecutor::execute: stop requested");
                break;
            }
            if !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }

            let result = match ctx.operation_type() {
                OperationType::BatchRename => {
                    let name = file_name(item);
                    ItemResult::renamed(item.clone(), name, format!("{}{}", prefix, name))
                }
                _ => ItemResult::ok(item.clone()),
            };
            info!(operation_id = ctx.operation_id(), %item, "dry-run: would process");
            results.push(result);

            ctx.report_progress(ProgressUpdate {
                processed: results.len() as u32,
                failed: 0,
                current_item: Some(item.clone()),
                bytes_processed: 0,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_dry_run_processes_all() {
        let (ctx, rx) = ExecutionContext::new(
            "op",
            OperationType::Copy,
            vec!["/a".to_string(), "/b".to_string()],
            serde_json::Value::Null,
            1,
            CancellationToken::new(),
        );
        let results = DryRunExecutor::new().execute(&ctx).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(rx.borrow().as_ref().map(|p| p.processed), Some(2));
    }

    #[tokio::test]
    async fn test_dry_run_rename_preview() {
        let (ctx, _rx) = ExecutionContext::new(
            "op",
            OperationType::BatchRename,
            vec!["/photos/a.jpg".to_string()],
            serde_json::json!({"prefix": "2024-"}),
            1,
            CancellationToken::new(),
        );
        let results = DryRunExecutor::new().execute(&ctx).await.unwrap();
        assert_eq!(results[0].original_name.as_deref(), Some("a.jpg"));
        assert_eq!(results[0].new_name.as_deref(), Some("2024-a.jpg"));
    }

    #[tokio::test]
    async fn test_dry_run_stops_at_checkpoint() {
        let token = CancellationToken::new();
        token.cancel();
        let (ctx, _rx) = ExecutionContext::new(
            "op",
            OperationType::Delete,
            vec!["/a".to_string()],
            serde_json::Value::Null,
            1,
            token,
        );
        let results = DryRunExecutor::new().execute(&ctx).await.unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
    }
}
