//! oq - command-line client for the opqueue operation queue
//!
//! Every command opens the store directly. `oq run` drives the scheduler with
//! the dry-run executor until the queue is idle.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use opqueue::cli::{Cli, Command, OutputFormat, get_log_path};
use opqueue::config::Config;
use opqueue::domain::{Operation, OperationFilter, OperationSpec, OperationStatus, matching_ids, now_ms};
use opqueue::events::QueueEvent;
use opqueue::executor::DryRunExecutor;
use opqueue::scheduler::ConfigUpdate;
use opqueue::service::OperationQueue;
use opqueue::stats::Statistics;

fn setup_logging(verbose: bool) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.store_dir {
        config.storage.store_dir = dir.to_string_lossy().into_owned();
    }
    config.validate().context("Invalid configuration")?;
    let format = cli.format;

    debug!(command = ?cli.command, "main: dispatching command");
    if let Command::Config = cli.command {
        return cmd_config(&config, format);
    }

    let queue = OperationQueue::open(&config).await?;
    let result = dispatch(&queue, &config, cli.command, format).await;
    queue.shutdown().await?;
    result
}

async fn dispatch(queue: &OperationQueue, config: &Config, command: Command, format: OutputFormat) -> Result<()> {
    match command {
        Command::Submit {
            operation_type,
            items,
            priority,
            description,
            tags,
            params,
            delay,
            at,
            max_attempts,
        } => {
            debug!(%operation_type, items = items.len(), %priority, "main: matched Submit command");
            let mut spec = OperationSpec::new(operation_type, items).with_priority(priority);
            if let Some(description) = description {
                spec = spec.with_description(description);
            }
            for tag in tags {
                spec = spec.with_tag(tag);
            }
            if let Some(params) = params {
                let value = serde_json::from_str(&params).context("--params is not valid JSON")?;
                spec = spec.with_params(value);
            }
            if let Some(secs) = delay {
                spec = spec.scheduled_at(now_ms() + (secs as i64).saturating_mul(1000));
            }
            if let Some(at) = at {
                let when = chrono::DateTime::parse_from_rfc3339(&at)
                    .wrap_err_with(|| format!("Invalid --at timestamp '{}'", at))?;
                spec = spec.scheduled_at(when.timestamp_millis());
            }
            if let Some(max_attempts) = max_attempts {
                let policy = queue.default_retry_policy().with_max_attempts(max_attempts);
                spec = spec.with_retry_policy(policy);
            }
            cmd_submit(queue, spec, format).await
        }
        Command::List {
            status,
            operation_type,
            tag,
        } => {
            debug!(?status, ?operation_type, ?tag, "main: matched List command");
            let filter = OperationFilter {
                statuses: status.into_iter().collect(),
                operation_type,
                tag,
            };
            cmd_list(queue, filter, format).await
        }
        Command::Show { id } => {
            debug!(%id, "main: matched Show command");
            let id = resolve_id(queue, &id).await?;
            let op = queue.get(&id).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&op)?),
                OutputFormat::Text => print_operation(&op),
            }
            Ok(())
        }
        Command::Stats => {
            debug!("main: matched Stats command");
            let stats = queue.statistics().await?;
            print_statistics(&stats, format)
        }
        Command::Cancel { id } => {
            let id = resolve_id(queue, &id).await?;
            let op = queue.cancel(&id).await?;
            print_transition("Cancelled", &op, format)
        }
        Command::Pause { id } => {
            let id = resolve_id(queue, &id).await?;
            let op = queue.pause(&id).await?;
            print_transition("Paused", &op, format)
        }
        Command::Resume { id } => {
            let id = resolve_id(queue, &id).await?;
            let op = queue.resume(&id).await?;
            print_transition("Resumed", &op, format)
        }
        Command::Retry { id } => {
            let id = resolve_id(queue, &id).await?;
            let op = queue.retry(&id).await?;
            print_transition("Requeued", &op, format)
        }
        Command::Remove { id } => {
            let id = resolve_id(queue, &id).await?;
            let op = queue.remove(&id).await?;
            print_transition("Removed", &op, format)
        }
        Command::RunNow { id } => {
            let id = resolve_id(queue, &id).await?;
            let op = queue.run_now(&id).await?;
            print_transition("Boosted", &op, format)
        }
        Command::ClearCompleted => {
            debug!("main: matched ClearCompleted command");
            let removed = queue.clear_completed().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
                OutputFormat::Text => println!("{} Removed {} finished operations", "✓".green(), removed),
            }
            Ok(())
        }
        Command::Run {
            follow,
            max_parallel,
            item_delay_ms,
        } => {
            debug!(follow, ?max_parallel, item_delay_ms, "main: matched Run command");
            cmd_run(queue, follow, max_parallel, item_delay_ms, format).await
        }
        Command::Config => cmd_config(config, format),
    }
}

/// Resolve an ID or unique ID prefix
async fn resolve_id(queue: &OperationQueue, query: &str) -> Result<String> {
    debug!(%query, "resolve_id: called");
    let ops = queue.list(OperationFilter::all()).await?;
    let matches = matching_ids(query, ops.iter().map(|op| op.id.as_str()));
    match matches.as_slice() {
        [id] => Ok(id.to_string()),
        [] => Err(eyre!("No operation matches '{}'", query)),
        many => Err(eyre!("'{}' matches {} operations: {}", query, many.len(), many.join(", "))),
    }
}

async fn cmd_submit(queue: &OperationQueue, spec: OperationSpec, format: OutputFormat) -> Result<()> {
    let id = queue.submit(spec).await?;
    match format {
        OutputFormat::Json => {
            let op = queue.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&op)?);
        }
        OutputFormat::Text => println!("{}", id),
    }
    Ok(())
}

async fn cmd_list(queue: &OperationQueue, filter: OperationFilter, format: OutputFormat) -> Result<()> {
    let ops = queue.list(filter).await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(());
    }

    if ops.is_empty() {
        println!("No operations.");
        return Ok(());
    }
    for op in &ops {
        println!(
            "{:<44} {} {:<7} {:<12} {}/{}{}",
            op.id,
            paint_status(op.status),
            op.priority.to_string(),
            op.operation_type.to_string(),
            op.processed_count,
            op.items_count,
            if op.failed_count > 0 {
                format!(" ({} failed)", op.failed_count).red().to_string()
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn cmd_config(config: &Config, format: OutputFormat) -> Result<()> {
    debug!("cmd_config: called");
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => print!("{}", serde_yaml::to_string(config)?),
    }
    Ok(())
}

/// Drive the scheduler until nothing is queued, scheduled or running
async fn cmd_run(
    queue: &OperationQueue,
    follow: bool,
    max_parallel: Option<usize>,
    item_delay_ms: u64,
    format: OutputFormat,
) -> Result<()> {
    let executor = DryRunExecutor::new().with_item_delay(Duration::from_millis(item_delay_ms));
    queue.registry().register_all(Arc::new(executor));

    if let Some(max) = max_parallel {
        queue
            .update_config(ConfigUpdate {
                max_parallel_operations: Some(max),
                ..Default::default()
            })
            .await?;
    }

    let recovery = queue.recovery_stats();
    if recovery.interrupted > 0 && format == OutputFormat::Text {
        println!("{} Requeued {} interrupted operations", "!".yellow(), recovery.interrupted);
    }

    let mut events = queue.subscribe();
    queue.start()?;
    info!(follow, "Run started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut idle_check = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("cmd_run: interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, format)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = idle_check.tick() => {
                if !follow && is_idle(&queue.statistics().await?) {
                    debug!("cmd_run: queue idle");
                    break;
                }
            }
        }
    }

    let stats = queue.statistics().await?;
    if format == OutputFormat::Text {
        println!();
        print_statistics(&stats, format)?;
    }
    Ok(())
}

fn is_idle(stats: &Statistics) -> bool {
    stats.queued + stats.scheduled + stats.running == 0
}

fn paint_status(status: OperationStatus) -> ColoredString {
    let padded = format!("{:<9}", status.as_str());
    match status {
        OperationStatus::Completed => padded.green(),
        OperationStatus::Failed => padded.red(),
        OperationStatus::Running => padded.cyan(),
        OperationStatus::Paused | OperationStatus::Cancelled => padded.yellow(),
        OperationStatus::Queued | OperationStatus::Scheduled => padded.normal(),
    }
}

fn print_transition(action: &str, op: &Operation, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(op)?),
        OutputFormat::Text => println!("{} {} {} ({})", "✓".green(), action, op.id.cyan(), op.status),
    }
    Ok(())
}

fn print_event(event: &QueueEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => match event {
            QueueEvent::StatusChanged { id, from, to } => {
                println!("{} {} -> {}", id.cyan(), from, paint_status(*to));
            }
            QueueEvent::ConfigUpdated {
                max_parallel_operations,
            } => {
                println!("max-parallel-operations = {}", max_parallel_operations);
            }
            _ => {}
        },
    }
    Ok(())
}

fn print_statistics(stats: &Statistics, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }
    println!("Operations: {}", stats.total);
    println!("  Queued:    {}", stats.queued);
    println!("  Scheduled: {}", stats.scheduled);
    println!("  Running:   {}", stats.running);
    println!("  Paused:    {}", stats.paused);
    println!("  Completed: {}", stats.completed.to_string().green());
    println!("  Failed:    {}", stats.failed.to_string().red());
    println!("  Cancelled: {}", stats.cancelled);
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_operation(op: &Operation) {
    println!("{}", op.id.cyan());
    println!("  Type:        {}", op.operation_type);
    println!("  Status:      {}", paint_status(op.status));
    println!("  Priority:    {}", op.priority);
    if let Some(description) = &op.description {
        println!("  Description: {}", description);
    }
    if !op.tags.is_empty() {
        println!("  Tags:        {}", op.tags.join(", "));
    }
    println!("  Created:     {}", format_ms(op.created_at));
    if let Some(at) = op.scheduled_at {
        println!("  Scheduled:   {}", format_ms(at));
    }
    if let Some(at) = op.started_at {
        println!("  Started:     {}", format_ms(at));
    }
    if let Some(at) = op.completed_at {
        println!("  Finished:    {}", format_ms(at));
    }
    println!(
        "  Progress:    {}/{} processed, {} failed",
        op.processed_count, op.items_count, op.failed_count
    );
    println!(
        "  Attempt:     {} of {}",
        op.current_attempt, op.retry_policy.max_attempts
    );
    if let Some(error) = &op.error_message {
        println!("  Error:       {}", error.red());
    }

    if !op.retry_attempts.is_empty() {
        println!("  Attempts:");
        for attempt in &op.retry_attempts {
            println!(
                "    #{} {} {}",
                attempt.attempt_number,
                format_ms(attempt.ended_at),
                attempt.error
            );
        }
    }

    println!("  Items:");
    for item in &op.items {
        match op.results.iter().find(|r| &r.path == item) {
            Some(result) if result.success => match (&result.original_name, &result.new_name) {
                (Some(from), Some(to)) => println!("    {} {} ({} -> {})", "✓".green(), item, from, to),
                _ => println!("    {} {}", "✓".green(), item),
            },
            Some(result) => println!(
                "    {} {} {}",
                "✗".red(),
                item,
                result.error_message.as_deref().unwrap_or("")
            ),
            None => println!("    {} {}", "·".dimmed(), item),
        }
    }
}
