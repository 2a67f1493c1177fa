//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{OperationStatus, OperationType, Priority};

/// oq - durable priority queue for batch file operations
#[derive(Parser)]
#[command(
    name = "oq",
    about = "Durable priority queue and scheduler for batch file operations",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Store directory, overriding storage.store-dir
    #[arg(long, global = true, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a new operation
    Submit {
        /// Operation type (copy, move, delete, archive, extract, batch-rename, batch-attribute, custom)
        #[arg(value_name = "TYPE")]
        operation_type: OperationType,

        /// Paths the operation acts on
        #[arg(required = true, num_args = 1..)]
        items: Vec<String>,

        /// Priority (low, normal, high, urgent)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Human-readable description
        #[arg(short, long)]
        description: Option<String>,

        /// Tag, may be repeated
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Executor parameters as a JSON object
        #[arg(long, value_name = "JSON")]
        params: Option<String>,

        /// Hold the operation until this many seconds from now
        #[arg(long, value_name = "SECS", conflicts_with = "at")]
        delay: Option<u64>,

        /// Hold the operation until an RFC 3339 timestamp
        #[arg(long, value_name = "TIME")]
        at: Option<String>,

        /// Attempts before the operation is marked failed
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// List operations
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<OperationStatus>,

        /// Filter by operation type
        #[arg(short = 't', long = "type")]
        operation_type: Option<OperationType>,

        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show one operation in full
    Show {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Show counts per status
    Stats,

    /// Cancel an operation
    Cancel {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Hold a queued or scheduled operation
    Pause {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Release a paused operation
    Resume {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Requeue a failed or cancelled operation with a fresh attempt budget
    Retry {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Delete an operation
    Remove {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Admit an operation ahead of everything else
    RunNow {
        /// Operation ID (or unique prefix)
        id: String,
    },

    /// Remove completed, failed and cancelled operations
    ClearCompleted,

    /// Print the effective configuration
    Config,

    /// Drive the queue with the dry-run executor until idle or Ctrl-C
    Run {
        /// Keep running after the queue is idle
        #[arg(long)]
        follow: bool,

        /// Override queue.max-parallel-operations for this run
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,

        /// Simulated time per item in milliseconds
        #[arg(long, default_value = "0", value_name = "MS")]
        item_delay_ms: u64,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opqueue")
        .join("logs")
        .join("opqueue.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for command results
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_submit() {
        let cli = Cli::parse_from([
            "oq",
            "submit",
            "batch-rename",
            "/a.jpg",
            "/b.jpg",
            "-p",
            "urgent",
            "--tag",
            "photos",
            "--params",
            r#"{"prefix":"x-"}"#,
        ]);
        if let Command::Submit {
            operation_type,
            items,
            priority,
            tags,
            params,
            delay,
            ..
        } = cli.command
        {
            assert_eq!(operation_type, OperationType::BatchRename);
            assert_eq!(items, vec!["/a.jpg".to_string(), "/b.jpg".to_string()]);
            assert_eq!(priority, Priority::Urgent);
            assert_eq!(tags, vec!["photos".to_string()]);
            assert!(params.is_some());
            assert!(delay.is_none());
        } else {
            panic!("Expected Submit command");
        }
    }

    #[test]
    fn test_cli_submit_requires_items() {
        assert!(Cli::try_parse_from(["oq", "submit", "copy"]).is_err());
    }

    #[test]
    fn test_cli_submit_rejects_unknown_type() {
        assert!(Cli::try_parse_from(["oq", "submit", "teleport", "/a"]).is_err());
    }

    #[test]
    fn test_cli_delay_conflicts_with_at() {
        let result = Cli::try_parse_from([
            "oq",
            "submit",
            "copy",
            "/a",
            "--delay",
            "5",
            "--at",
            "2030-01-01T00:00:00Z",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_list_filters() {
        let cli = Cli::parse_from(["oq", "list", "--status", "failed", "--type", "copy"]);
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(OperationStatus::Failed),
                operation_type: Some(OperationType::Copy),
                tag: None,
            }
        ));
    }

    #[test]
    fn test_cli_parse_run_now() {
        let cli = Cli::parse_from(["oq", "run-now", "9f3a"]);
        assert!(matches!(cli.command, Command::RunNow { id } if id == "9f3a"));
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["oq", "stats", "--store-dir", "/tmp/q", "-f", "json", "-v"]);
        assert_eq!(cli.store_dir, Some(PathBuf::from("/tmp/q")));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Stats));
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["oq", "-c", "/path/to/config.yml", "config"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("table".parse::<OutputFormat>().is_err());
    }
}
