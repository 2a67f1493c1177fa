//! Executor registry

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::domain::OperationType;

use super::Executor;

/// Maps each operation type to its executor
///
/// Registration may happen while the queue runs; operations whose type has
/// no executor fail at admission.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<OperationType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an executor to a type, replacing any previous binding
    pub fn register(&self, operation_type: OperationType, executor: Arc<dyn Executor>) {
        debug!(%operation_type, executor = executor.name(), "ExecutorRegistry::register: called");
        self.executors.insert(operation_type, executor);
    }

    /// Bind one executor to every operation type
    pub fn register_all(&self, executor: Arc<dyn Executor>) {
        for operation_type in OperationType::ALL {
            self.register(operation_type, executor.clone());
        }
    }

    pub fn get(&self, operation_type: OperationType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&operation_type).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, operation_type: OperationType) -> bool {
        self.executors.contains_key(&operation_type)
    }

    pub fn unregister(&self, operation_type: OperationType) -> Option<Arc<dyn Executor>> {
        self.executors.remove(&operation_type).map(|(_, executor)| executor)
    }

    /// Registered types in declaration order
    pub fn registered_types(&self) -> Vec<OperationType> {
        OperationType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }
}
