//! Event types emitted by the queue

use serde::Serialize;

use crate::domain::{OperationStatus, OperationType};

/// A committed change to the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A new operation was stored
    Submitted {
        id: String,
        operation_type: OperationType,
        status: OperationStatus,
    },

    /// An operation changed status
    StatusChanged {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    /// Progress counters moved without a status change
    Progress {
        id: String,
        processed_count: u32,
        failed_count: u32,
        items_count: u32,
        current_item: Option<String>,
    },

    /// An operation was deleted
    Removed { id: String },

    /// Runtime configuration changed
    ConfigUpdated { max_parallel_operations: usize },
}

impl QueueEvent {
    /// Short name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::StatusChanged { .. } => "status_changed",
            Self::Progress { .. } => "progress",
            Self::Removed { .. } => "removed",
            Self::ConfigUpdated { .. } => "config_updated",
        }
    }

    /// Operation the event concerns, if any
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Submitted { id, .. }
            | Self::StatusChanged { id, .. }
            | Self::Progress { id, .. }
            | Self::Removed { id } => Some(id),
            Self::ConfigUpdated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_tagged() {
        let event = QueueEvent::StatusChanged {
            id: "x".to_string(),
            from: OperationStatus::Running,
            to: OperationStatus::Completed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["to"], "completed");
    }

    #[test]
    fn test_config_event_has_no_operation() {
        let event = QueueEvent::ConfigUpdated {
            max_parallel_operations: 2,
        };
        assert!(event.operation_id().is_none());
    }
}
