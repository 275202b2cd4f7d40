//! `bosun branch` -- tracking-branch sync and stale-branch cleanup.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use bosun_core::branch::BranchManager;
use bosun_core::git::GitRepo;
use bosun_core::throttle::{BRANCH_SYNC_DEFAULT, LogThrottle};

use crate::BranchCommands;
use crate::config;

pub async fn run(config_dir: &Path, command: BranchCommands) -> Result<()> {
    let file = config::load_config(config_dir)?;
    let repo_root = file.repo_root();
    let repo = GitRepo::open(&repo_root)
        .await
        .with_context(|| format!("cannot open repository at {}", repo_root.display()))?;

    let throttle = Arc::new(LogThrottle::from_env(
        "BRANCH_SYNC_LOG_THROTTLE_MS",
        BRANCH_SYNC_DEFAULT,
    ));
    let manager = BranchManager::new(repo, Arc::new(Mutex::new(())), throttle);

    match command {
        BranchCommands::Sync { branches } => {
            let branches = if branches.is_empty() {
                file.sweep_config().sync_branches
            } else {
                branches
            };
            let report = manager.sync_local_tracking_branches(&branches).await;
            println!("synced {} of {} branches", report.synced, report.actions.len());
            for (branch, action) in &report.actions {
                println!("  {branch}: {action:?}");
            }
        }
        BranchCommands::Cleanup { dry_run } => {
            let opts = file.cleanup_options(dry_run);
            let report = manager.cleanup_stale_branches(&opts).await;
            let verb = if dry_run { "would delete" } else { "deleted" };
            println!("{verb} {} branches", report.deleted.len());
            for branch in &report.deleted {
                println!("  {verb} {branch}");
            }
            for (branch, reason) in &report.skipped {
                println!("  skipped {branch}: {reason}");
            }
            for (branch, error) in &report.errors {
                println!("  error {branch}: {error}");
            }
        }
    }
    Ok(())
}
