//! The periodic maintenance sweep.
//!
//! Runs out-of-band on a timer, serialized with task dispatch through
//! the supervisor's global mutex. Every step is best-effort: a failing
//! step is logged, its count stays at zero, and the sweep moves on. The
//! next sweep retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::branch::{BranchManager, CleanupOptions};
use crate::process::ProcessEnum;
use crate::process::classify::{CmdlineClass, classify};
use crate::taskstore::TaskStore;
use crate::worktree::WorktreeManager;

/// Default age after which an in-flight `git push` is presumed stuck.
pub const DEFAULT_PUSH_MAX_AGE: Duration = Duration::from_secs(15 * 60);

/// Default age after which terminal tasks are archived.
pub const DEFAULT_ARCHIVE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Sweep configuration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Kill `git push` processes older than this.
    pub push_max_age: Duration,
    /// Branches to fast-forward against origin each sweep.
    pub sync_branches: Vec<String>,
    /// Stale-branch GC options.
    pub cleanup: CleanupOptions,
    /// Archive terminal tasks older than this.
    pub archive_age: Duration,
    /// A child monitor PID that must survive the stale-kill step.
    pub child_pid: Option<u32>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            push_max_age: DEFAULT_PUSH_MAX_AGE,
            sync_branches: vec!["main".to_string()],
            cleanup: CleanupOptions::default(),
            archive_age: DEFAULT_ARCHIVE_AGE,
            child_pid: None,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub stale_killed: u64,
    pub pushes_reaped: u64,
    pub worktrees_pruned: u64,
    pub branches_synced: u64,
    pub branches_deleted: u64,
    pub tasks_archived: u64,
}

/// Runs the ordered maintenance steps for one repository.
pub struct MaintenanceSweeper {
    process_enum: Arc<dyn ProcessEnum>,
    worktrees: WorktreeManager,
    branches: BranchManager,
    /// Optional hook into the task store for archival.
    store: Option<Arc<TaskStore>>,
    config: SweepConfig,
}

impl MaintenanceSweeper {
    pub fn new(
        process_enum: Arc<dyn ProcessEnum>,
        worktrees: WorktreeManager,
        branches: BranchManager,
        store: Option<Arc<TaskStore>>,
        config: SweepConfig,
    ) -> Self {
        Self {
            process_enum,
            worktrees,
            branches,
            store,
            config,
        }
    }

    /// Run one full sweep. Steps run in order; each is best-effort.
    pub async fn sweep(&self) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();

        // 1. Stale orchestrators.
        match self.kill_stale_orchestrators().await {
            Ok(killed) => summary.stale_killed = killed,
            Err(e) => tracing::warn!(error = %e, "stale-orchestrator step failed"),
        }

        // 2. Stuck pushes.
        match self.reap_stuck_git_pushes().await {
            Ok(reaped) => summary.pushes_reaped = reaped,
            Err(e) => tracing::warn!(error = %e, "push-reap step failed"),
        }

        // 3. Worktree pruning.
        match self.worktrees.prune_stale().await {
            Ok(report) => summary.worktrees_pruned = report.total(),
            Err(e) => tracing::warn!(error = %e, "worktree-prune step failed"),
        }

        // 4. Tracking-branch sync.
        let report = self
            .branches
            .sync_local_tracking_branches(&self.config.sync_branches)
            .await;
        summary.branches_synced = report.synced;

        // 5. Stale-branch GC.
        let report = self.branches.cleanup_stale_branches(&self.config.cleanup).await;
        summary.branches_deleted = report.deleted.len() as u64;
        for (branch, error) in &report.errors {
            tracing::warn!(branch = %branch, error = %error, "branch cleanup error");
        }

        // 6. Task archival.
        if let Some(store) = &self.store {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.config.archive_age)
                    .unwrap_or_else(|_| chrono::Duration::days(7));
            match store.archive_older_than(cutoff).await {
                Ok(archived) => summary.tasks_archived = archived.len() as u64,
                Err(e) => tracing::warn!(error = %e, "task-archive step failed"),
            }
        }

        // 7. Config corruption repair.
        if let Err(e) = self.worktrees.repair_config_corruption().await {
            tracing::warn!(error = %e, "config-repair step failed");
        }

        tracing::info!(
            stale_killed = summary.stale_killed,
            pushes_reaped = summary.pushes_reaped,
            worktrees_pruned = summary.worktrees_pruned,
            branches_synced = summary.branches_synced,
            branches_deleted = summary.branches_deleted,
            tasks_archived = summary.tasks_archived,
            "maintenance sweep complete"
        );
        summary
    }

    /// Kill monitor processes that are neither this process nor the
    /// registered child.
    pub async fn kill_stale_orchestrators(&self) -> Result<u64, crate::process::ProcessError> {
        let self_pid = std::process::id();
        let mut killed = 0;

        for proc in self.process_enum.list().await? {
            if proc.pid == self_pid || Some(proc.pid) == self.config.child_pid {
                continue;
            }
            if classify(&proc.command_line) != CmdlineClass::Monitor {
                continue;
            }
            tracing::warn!(
                pid = proc.pid,
                cmdline = %proc.command_line,
                "killing stale orchestrator process"
            );
            self.process_enum.kill(proc.pid).await?;
            killed += 1;
        }

        Ok(killed)
    }

    /// Kill `git push` processes older than the configured age.
    pub async fn reap_stuck_git_pushes(&self) -> Result<u64, crate::process::ProcessError> {
        let now = Utc::now();
        let max_age =
            chrono::Duration::from_std(self.config.push_max_age).unwrap_or_else(|_| {
                chrono::Duration::minutes(15)
            });
        let mut reaped = 0;

        for proc in self.process_enum.list().await? {
            if !is_git_push(&proc.command_line) {
                continue;
            }
            let Some(started) = proc.started_at else {
                continue;
            };
            if now.signed_duration_since(started) <= max_age {
                continue;
            }
            tracing::warn!(
                pid = proc.pid,
                cmdline = %proc.command_line,
                "reaping stuck git push"
            );
            self.process_enum.kill(proc.pid).await?;
            reaped += 1;
        }

        Ok(reaped)
    }
}

/// Whether a command line is a `git push` invocation.
fn is_git_push(command_line: &str) -> bool {
    let normalized = command_line.to_ascii_lowercase();
    normalized.contains("git push") || normalized.contains("git.exe push")
}
