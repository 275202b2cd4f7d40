//! `bosun worktree` -- worktree maintenance.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use bosun_core::git::GitRepo;
use bosun_core::worktree::WorktreeManager;

use crate::config;
use crate::WorktreeCommands;

pub async fn run(config_dir: &Path, command: WorktreeCommands) -> Result<()> {
    let file = config::load_config(config_dir)?;
    let repo_root = file.repo_root();
    let repo = GitRepo::open(&repo_root)
        .await
        .with_context(|| format!("cannot open repository at {}", repo_root.display()))?;
    let manager = WorktreeManager::new(repo, Arc::new(Mutex::new(())));

    match command {
        WorktreeCommands::Prune => {
            let report = manager.prune_stale().await?;
            println!(
                "pruned {} worktrees ({} missing on disk, {} aged out)",
                report.total(),
                report.missing_removed,
                report.aged_removed,
            );
        }
    }
    Ok(())
}
