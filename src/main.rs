//! Cadence - Transactional Loop Controller
//!
//! Command-line front end: run a shell command as a controlled loop,
//! inspect persisted loop state and history, and maintain the
//! transaction log.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};

use cadence::{
    keys, state, ControllerConfig, LoopController, PersistenceConfig, StatePersistenceManager,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version = "0.1.0")]
#[command(about = "Run long-lived loops with durable, transactional state", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Storage directory for loop state (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command as a controlled loop until a condition fires
    Run {
        /// Loop identifier
        loop_id: String,

        /// Command executed once per iteration (via `sh -c`)
        #[arg(short, long)]
        command: String,

        /// Maximum iterations (0 to run unbounded)
        #[arg(short, long, default_value = "50")]
        max_iterations: u64,

        /// Wall-clock timeout in seconds (0 to disable)
        #[arg(short, long, default_value = "0")]
        timeout: f64,

        /// Failed iterations tolerated before aborting
        #[arg(long, default_value = "3")]
        error_threshold: u32,
    },

    /// Print a loop's persisted state
    State {
        /// Loop identifier
        loop_id: String,

        /// Emit raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Print a loop's execution history
    History {
        /// Loop identifier
        loop_id: String,

        /// Most recent entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print a loop's committed transaction log
    Transactions {
        /// Loop identifier
        loop_id: String,

        /// Most recent entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Rebuild a loop's state by replaying its committed transactions
    Recover {
        /// Loop identifier
        loop_id: String,
    },

    /// Delete committed transaction records older than the retention window
    Cleanup {
        /// Loop identifier
        loop_id: String,

        /// Retention window in days
        #[arg(short, long, default_value = "30")]
        retention_days: u32,
    },
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "cadence=debug,info"
    } else {
        "cadence=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let storage_root = cli.storage.unwrap_or_else(default_storage_dir);
    let persistence = Arc::new(StatePersistenceManager::new(PersistenceConfig::new(
        &storage_root,
    ))?);

    match cli.command {
        Commands::Run {
            loop_id,
            command,
            max_iterations,
            timeout,
            error_threshold,
        } => {
            let config = ControllerConfig::new().with_error_threshold(error_threshold);
            let controller = LoopController::new(&loop_id, persistence, config)?;

            if max_iterations > 0 {
                controller.set_max_iterations(max_iterations)?;
            }
            if timeout > 0.0 {
                controller.set_timeout(timeout)?;
            }

            println!(
                "{} loop '{}' running: {}",
                "Starting".green().bold(),
                loop_id,
                command
            );

            let shell_command = command.clone();
            controller
                .start(move |_state| run_shell_iteration(&shell_command))
                .await?;

            // Wait for a terminal state, aborting cleanly on Ctrl-C.
            loop {
                if !controller.is_running() {
                    break;
                }
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{} interrupt received, stopping loop", "!".yellow().bold());
                        controller.stop("interrupted by user").await;
                        break;
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                }
            }

            let final_state = controller.get_state();
            print_verdict(&loop_id, &final_state);

            if state::loop_state_of(&final_state) == Some(cadence::LoopState::Failed) {
                std::process::exit(1);
            }
        }

        Commands::State { loop_id, json } => {
            let snapshot = persistence.load_state(&loop_id);
            if snapshot.is_empty() {
                eprintln!("{} no state for loop '{}'", "Error:".red().bold(), loop_id);
                std::process::exit(1);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_state_summary(&loop_id, &snapshot);
            }
        }

        Commands::History { loop_id, limit } => {
            let snapshot = persistence.load_state(&loop_id);
            let history = state::execution_history_of(&snapshot);
            if history.is_empty() {
                println!("No execution history for loop '{loop_id}'");
                return Ok(());
            }
            let start = history.len().saturating_sub(limit);
            for record in &history[start..] {
                let marker = if record.success {
                    "✓".green().to_string()
                } else {
                    "✗".red().to_string()
                };
                let detail = record
                    .result
                    .as_deref()
                    .or(record.error.as_deref())
                    .unwrap_or("");
                println!(
                    "{marker} iteration {:>4}  {:>6}ms  {detail}",
                    record.iteration, record.duration_ms
                );
            }
        }

        Commands::Transactions { loop_id, limit } => {
            let records = persistence.get_transaction_history(&loop_id)?;
            if records.is_empty() {
                println!("No transactions for loop '{loop_id}'");
                return Ok(());
            }
            let start = records.len().saturating_sub(limit);
            for txn in &records[start..] {
                println!(
                    "{}  {}  {}  {} change(s)",
                    txn.created_at.format("%Y-%m-%d %H:%M:%S"),
                    txn.id,
                    txn.status,
                    txn.changes.len()
                );
            }
        }

        Commands::Recover { loop_id } => {
            let rebuilt = persistence.recover_state(&loop_id)?;
            println!(
                "{} state for loop '{}' rebuilt from {} key(s)",
                "OK".green().bold(),
                loop_id,
                rebuilt.len()
            );
        }

        Commands::Cleanup {
            loop_id,
            retention_days,
        } => {
            let removed = persistence.cleanup_old_transactions(&loop_id, retention_days)?;
            println!(
                "{} removed {removed} transaction record(s) older than {retention_days} day(s)",
                "OK".green().bold()
            );
        }
    }

    Ok(())
}

/// One iteration: run the command under `sh -c`, returning its stdout on
/// success. A non-zero exit counts as a failed iteration.
fn run_shell_iteration(shell_command: &str) -> anyhow::Result<Value> {
    let output = Command::new("sh").arg("-c").arg(shell_command).output()?;
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(json!(stdout))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        anyhow::bail!(
            "command exited with {}: {stderr}",
            output.status.code().unwrap_or(-1)
        )
    }
}

fn print_state_summary(loop_id: &str, snapshot: &cadence::StateMap) {
    println!("Loop:       {loop_id}");
    if let Some(loop_state) = state::loop_state_of(snapshot) {
        println!("State:      {loop_state}");
    }
    println!(
        "Iterations: {}",
        state::get_u64(snapshot, keys::CURRENT_ITERATION)
    );
    if let Some(max) = state::get_opt_u64(snapshot, keys::MAX_ITERATIONS) {
        println!("Max:        {max}");
    }
    println!(
        "Errors:     {}",
        state::get_u64(snapshot, keys::ERROR_COUNT)
    );
    if let Some(reason) = state::get_str(snapshot, keys::TERMINATION_REASON) {
        println!("Reason:     {reason}");
    }
    if let Some(details) = state::get_str(snapshot, keys::TERMINATION_DETAILS) {
        println!("Details:    {details}");
    }
}

fn print_verdict(loop_id: &str, snapshot: &cadence::StateMap) {
    let verdict = match state::loop_state_of(snapshot) {
        Some(cadence::LoopState::Completed) => "completed".green().bold().to_string(),
        Some(cadence::LoopState::Failed) => "failed".red().bold().to_string(),
        Some(cadence::LoopState::Aborted) => "aborted".yellow().bold().to_string(),
        other => format!("{other:?}"),
    };
    println!(
        "\nLoop '{}' {verdict} after {} iteration(s)",
        loop_id,
        state::get_u64(snapshot, keys::CURRENT_ITERATION)
    );
    if let Some(details) = state::get_str(snapshot, keys::TERMINATION_DETAILS) {
        println!("  {details}");
    }
}
