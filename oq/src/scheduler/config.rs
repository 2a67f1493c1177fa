//! Runtime configuration manager
//!
//! Holds the validated [`QueueConfig`] in a watch channel. Updates are
//! partial and validated as a whole before they are published.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::error::QueueResult;

/// Partial configuration change; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub max_parallel_operations: Option<usize>,
    #[serde(default)]
    pub auto_start: Option<bool>,
    #[serde(default)]
    pub persist_on_change: Option<bool>,
    #[serde(default)]
    pub check_scheduled_interval_sec: Option<u64>,
    #[serde(default)]
    pub progress_interval_ms: Option<u64>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The configuration that results from applying this update to `base`
    pub fn apply_to(&self, base: &QueueConfig) -> QueueConfig {
        QueueConfig {
            max_parallel_operations: self.max_parallel_operations.unwrap_or(base.max_parallel_operations),
            auto_start: self.auto_start.unwrap_or(base.auto_start),
            persist_on_change: self.persist_on_change.unwrap_or(base.persist_on_change),
            check_scheduled_interval_sec: self
                .check_scheduled_interval_sec
                .unwrap_or(base.check_scheduled_interval_sec),
            progress_interval_ms: self.progress_interval_ms.unwrap_or(base.progress_interval_ms),
        }
    }
}

/// Owner of the live queue configuration
pub struct ConfigManager {
    tx: watch::Sender<QueueConfig>,
}

impl ConfigManager {
    /// Create a manager; the initial configuration must be valid
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        debug!(?config, "ConfigManager::new: called");
        config.validate()?;
        let (tx, _) = watch::channel(config);
        Ok(Self { tx })
    }

    pub fn current(&self) -> QueueConfig {
        self.tx.borrow().clone()
    }

    /// Receiver that always sees the latest configuration
    pub fn subscribe(&self) -> watch::Receiver<QueueConfig> {
        self.tx.subscribe()
    }

    /// Validate and publish a partial update
    pub fn update(&self, update: &ConfigUpdate) -> QueueResult<QueueConfig> {
        debug!(?update, "ConfigManager::update: called");
        let next = update.apply_to(&self.current());
        next.validate()?;
        self.tx.send_replace(next.clone());
        info!(
            max_parallel_operations = next.max_parallel_operations,
            auto_start = next.auto_start,
            persist_on_change = next.persist_on_change,
            check_scheduled_interval_sec = next.check_scheduled_interval_sec,
            "Queue config updated"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    #[test]
    fn test_update_applies_partial() {
        let manager = ConfigManager::new(QueueConfig::default()).unwrap();
        let rx = manager.subscribe();

        let applied = manager
            .update(&ConfigUpdate {
                max_parallel_operations: Some(7),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(applied.max_parallel_operations, 7);
        assert_eq!(applied.check_scheduled_interval_sec, 60);
        assert_eq!(rx.borrow().max_parallel_operations, 7);
        assert_eq!(manager.current(), applied);
    }

    #[test]
    fn test_invalid_update_rejected() {
        let manager = ConfigManager::new(QueueConfig::default()).unwrap();
        let result = manager.update(&ConfigUpdate {
            max_parallel_operations: Some(0),
            auto_start: Some(false),
            ..Default::default()
        });

        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
        // Nothing from the rejected update is applied
        assert_eq!(manager.current(), QueueConfig::default());
    }

    #[test]
    fn test_invalid_initial_config() {
        let config = QueueConfig {
            check_scheduled_interval_sec: 0,
            ..Default::default()
        };
        assert!(ConfigManager::new(config).is_err());
    }

    #[test]
    fn test_is_empty() {
        assert!(ConfigUpdate::default().is_empty());
        assert!(
            !ConfigUpdate {
                auto_start: Some(true),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
