//! `bosun sweep` -- run one maintenance sweep.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use bosun_core::branch::BranchManager;
use bosun_core::git::GitRepo;
use bosun_core::lock::{Acquisition, LockManager};
use bosun_core::maintenance::MaintenanceSweeper;
use bosun_core::process::platform_default;
use bosun_core::supervisor::SupervisorError;
use bosun_core::taskstore::TaskStore;
use bosun_core::throttle::{BRANCH_SYNC_DEFAULT, LogThrottle};
use bosun_core::worktree::WorktreeManager;
use bosun_db::{config::DbConfig, pool};

use crate::config;

pub async fn run(config_dir: &Path) -> Result<()> {
    let file = config::load_config(config_dir)?;
    let repo_root = file.repo_root();

    // A sweep mutates repo state; it must not race a running
    // orchestrator on the same config directory.
    let lock = LockManager::new(config_dir, platform_default());
    match lock.acquire().await? {
        Acquisition::Acquired | Acquisition::AcquiredUnlocked => {}
        Acquisition::AlreadyRunning { pid } => {
            return Err(SupervisorError::LockContention { pid }.into());
        }
    }

    let repo = GitRepo::open(&repo_root)
        .await
        .with_context(|| format!("cannot open repository at {}", repo_root.display()))?;

    let repo_lock = Arc::new(Mutex::new(()));
    let throttle = Arc::new(LogThrottle::from_env(
        "BRANCH_SYNC_LOG_THROTTLE_MS",
        BRANCH_SYNC_DEFAULT,
    ));
    let worktrees = WorktreeManager::new(repo.clone(), Arc::clone(&repo_lock));
    let branches = BranchManager::new(repo, repo_lock, throttle);

    // The task store is optional: sweeping a repo without a database
    // still prunes worktrees and branches.
    let db_path = DbConfig::in_config_dir(config_dir);
    let store = if db_path.db_path.exists() {
        let pool = pool::create_pool(&db_path).await?;
        pool::run_migrations(&pool, pool::default_migrations_path()).await?;
        Some(Arc::new(TaskStore::new(
            pool,
            format!("bosun-{}", std::process::id()),
        )))
    } else {
        None
    };

    let sweeper = MaintenanceSweeper::new(
        platform_default(),
        worktrees,
        branches,
        store,
        file.sweep_config(),
    );

    let summary = sweeper.sweep().await;
    lock.release_if_owner();

    println!(
        "sweep complete: {} stale killed, {} pushes reaped, {} worktrees pruned, \
         {} branches synced, {} branches deleted, {} tasks archived",
        summary.stale_killed,
        summary.pushes_reaped,
        summary.worktrees_pruned,
        summary.branches_synced,
        summary.branches_deleted,
        summary.tasks_archived,
    );
    Ok(())
}
