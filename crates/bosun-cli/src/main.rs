mod branch_cmd;
mod config;
mod lock_cmd;
mod sweep_cmd;
mod task_cmds;
mod worktree_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bosun_core::kanban::BackendError;
use bosun_core::supervisor::SupervisorError;

/// Exit code for lock contention: another instance holds the lock.
const EXIT_LOCK_CONTENTION: u8 = 3;
/// Exit code for an unavailable external backend.
const EXIT_BACKEND_UNAVAILABLE: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "bosun", about = "Supervisor for fleets of LLM coding agents")]
struct Cli {
    /// Config directory (overrides BOSUN_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one maintenance sweep
    Sweep,
    /// Inspect or release the singleton lock
    Lock {
        /// Show the current lock owner
        #[arg(long)]
        status: bool,
        /// Remove the lock file if this process' config dir owns it
        #[arg(long)]
        release: bool,
    },
    /// Worktree management
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },
    /// Branch management
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },
    /// Task store operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorktreeCommands {
    /// Prune stale worktrees (missing directories, aged copilot trees)
    Prune,
}

#[derive(Subcommand, Debug)]
pub enum BranchCommands {
    /// Fast-forward local tracking branches against origin
    Sync {
        /// Branches to sync (defaults to the configured set)
        branches: Vec<String>,
    },
    /// Delete stale task branches
    Cleanup {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// List tasks
    List {
        /// Include archived tasks
        #[arg(long)]
        all: bool,
    },
    /// Show one task with its attempts
    Show {
        /// Task ID
        task_id: String,
    },
    /// Print the event log for a task
    Events {
        /// Task ID
        task_id: String,
    },
    /// Make a failed task dispatchable again
    Retry {
        /// Task ID
        task_id: String,
    },
    /// Cancel a task and its active attempt
    Cancel {
        /// Task ID
        task_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("bosun_core=info,bosun_db=info,bosun_cli=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = config::config_dir(cli.config_dir.as_ref());

    let result = match cli.command {
        Commands::Sweep => sweep_cmd::run(&config_dir).await,
        Commands::Lock { status, release } => lock_cmd::run(&config_dir, status, release).await,
        Commands::Worktree { command } => worktree_cmd::run(&config_dir, command).await,
        Commands::Branch { command } => branch_cmd::run(&config_dir, command).await,
        Commands::Task { command } => task_cmds::run(&config_dir, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}

/// Map an error chain to the documented exit codes.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if let Some(SupervisorError::LockContention { .. }) = cause.downcast_ref() {
            return EXIT_LOCK_CONTENTION;
        }
        if let Some(backend) = cause.downcast_ref::<BackendError>() {
            return match backend {
                BackendError::Unavailable(_) | BackendError::AuthMissing { .. } => {
                    EXIT_BACKEND_UNAVAILABLE
                }
                BackendError::Protocol(_) => 1,
            };
        }
    }
    1
}
