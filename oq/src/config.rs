//! opqueue configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{BackoffPolicy, BackoffStrategy, RetryPolicy};
use crate::error::{QueueError, QueueResult};

/// Main opqueue configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Full scheduling queue or the restricted batch queue
    pub mode: QueueMode,

    /// Scheduler and worker pool tunables
    pub queue: QueueConfig,

    /// Default retry policy for submissions that carry none
    pub retry: RetryConfig,

    /// Shutdown behaviour
    pub shutdown: ShutdownConfig,

    /// Storage location
    pub storage: StorageConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: self.retry.policy().backoff,
        }
        .validate()
        .context("Invalid retry section")?;
        Ok(())
    }

    /// Retry policy given to submissions that carry none
    pub fn default_retry_policy(&self) -> RetryPolicy {
        match self.mode {
            QueueMode::Full => self.retry.policy(),
            QueueMode::Batch => RetryPolicy::none(),
        }
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .opqueue.yml
        let local_config = PathBuf::from(".opqueue.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/opqueue/opqueue.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("opqueue").join("opqueue.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which queue surface the engine exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Scheduled submissions and automatic retries
    #[default]
    Full,
    /// Pending, running, done: submissions may not carry `scheduled_at` or a
    /// retry policy, and a failed run is never retried automatically
    Batch,
}

/// Runtime tunables, changeable while the queue runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker slots
    #[serde(rename = "max-parallel-operations")]
    pub max_parallel_operations: usize,

    /// Wake the scheduler as soon as an operation is submitted
    #[serde(rename = "auto-start")]
    pub auto_start: bool,

    /// fsync every mutation before it is acknowledged
    #[serde(rename = "persist-on-change")]
    pub persist_on_change: bool,

    /// Scheduler tick
    #[serde(rename = "check-scheduled-interval-sec")]
    pub check_scheduled_interval_sec: u64,

    /// Minimum spacing between progress writes for one operation
    #[serde(rename = "progress-interval-ms")]
    pub progress_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_operations: 3,
            auto_start: true,
            persist_on_change: true,
            check_scheduled_interval_sec: 60,
            progress_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_parallel_operations < 1 {
            return Err(QueueError::InvalidConfig(
                "max-parallel-operations must be at least 1".to_string(),
            ));
        }
        if self.check_scheduled_interval_sec < 1 {
            return Err(QueueError::InvalidConfig(
                "check-scheduled-interval-sec must be at least 1".to_string(),
            ));
        }
        if self.progress_interval_ms < 1 {
            return Err(QueueError::InvalidConfig(
                "progress-interval-ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    pub strategy: BackoffStrategy,

    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            strategy: policy.backoff.strategy,
            base_delay_ms: policy.backoff.base_delay_ms,
            max_delay_ms: policy.backoff.max_delay_ms,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(BackoffPolicy {
                strategy: self.strategy,
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
            })
    }
}

/// What happens to in-flight operations on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Let running operations finish, up to the timeout
    #[default]
    Drain,
    /// Signal every running operation immediately
    Cancel,
}

/// Shutdown behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub policy: ShutdownPolicy,

    /// Drain deadline; stragglers are cancelled after it
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            policy: ShutdownPolicy::Drain,
            timeout_secs: 30,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the operation store
    #[serde(rename = "store-dir")]
    pub store_dir: String,

    /// Rewrite the operations log on open so it holds one line per operation
    #[serde(rename = "compact-on-open")]
    pub compact_on_open: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/opqueue on Linux)
        let store_dir = dirs::data_dir()
            .map(|d| d.join("opqueue").join("store"))
            .unwrap_or_else(|| PathBuf::from(".opqueue"))
            .to_string_lossy()
            .into_owned();

        Self {
            store_dir,
            compact_on_open: true,
        }
    }
}

impl StorageConfig {
    /// Store directory with `~/` expanded
    pub fn store_path(&self) -> PathBuf {
        match self.store_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.store_dir)),
            None => PathBuf::from(&self.store_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.queue.max_parallel_operations, 3);
        assert!(config.queue.auto_start);
        assert!(config.queue.persist_on_change);
        assert_eq!(config.queue.check_scheduled_interval_sec, 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.shutdown.policy, ShutdownPolicy::Drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
queue:
  max-parallel-operations: 2
  auto-start: false
  persist-on-change: false
  check-scheduled-interval-sec: 5
  progress-interval-ms: 100

retry:
  max-attempts: 5
  strategy: linear
  base-delay-ms: 200
  max-delay-ms: 2000

shutdown:
  policy: cancel
  timeout-secs: 3

storage:
  store-dir: /tmp/opqueue-test
  compact-on-open: false
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.queue.max_parallel_operations, 2);
        assert!(!config.queue.auto_start);
        assert_eq!(config.queue.progress_interval_ms, 100);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.shutdown.policy, ShutdownPolicy::Cancel);
        assert_eq!(config.storage.store_path(), PathBuf::from("/tmp/opqueue-test"));

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff.delay_ms(2), 400);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
queue:
  max-parallel-operations: 8
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.mode, QueueMode::Full);
        assert_eq!(config.queue.max_parallel_operations, 8);
        assert!(config.queue.auto_start);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.shutdown.timeout_secs, 30);
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let mut config = Config::default();
        config.queue.max_parallel_operations = 0;
        assert!(config.validate().is_err());
        assert!(matches!(config.queue.validate(), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let queue = QueueConfig {
            check_scheduled_interval_sec: 0,
            ..Default::default()
        };
        assert!(queue.validate().is_err());

        let queue = QueueConfig {
            progress_interval_ms: 0,
            ..Default::default()
        };
        assert!(queue.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_mode_never_retries() {
        let config: Config = serde_yaml::from_str("mode: batch\nretry:\n  max-attempts: 5\n").unwrap();
        assert_eq!(config.mode, QueueMode::Batch);
        assert_eq!(config.default_retry_policy(), RetryPolicy::none());

        let full = Config::default();
        assert_eq!(full.default_retry_policy(), full.retry.policy());
    }

    #[test]
    fn test_validate_rejects_unbounded_backoff() {
        let mut config = Config::default();
        config.retry.base_delay_ms = 1000;
        config.retry.max_delay_ms = u64::MAX;
        assert!(config.validate().is_err());

        config.retry.max_delay_ms = crate::domain::MAX_BACKOFF_DELAY_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_path_expands_home() {
        let storage = StorageConfig {
            store_dir: "~/queue".to_string(),
            compact_on_open: true,
        };
        if let Some(home) = dirs::home_dir() {
            assert_eq!(storage.store_path(), home.join("queue"));
        }
    }
}
