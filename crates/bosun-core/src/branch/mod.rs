//! Local tracking-branch synchronization and stale-branch garbage
//! collection.
//!
//! Sync classifies each branch by its ahead/behind counts against
//! `origin/*` and applies exactly one action: push when ahead, fast
//! forward when behind, rebase-and-push when diverged and checked out
//! with a clean tree, skip otherwise. The dirty-tree decision is always
//! taken (and logged) before any divergence classification so the log
//! never shows a misleading "diverged" line ahead of the authoritative
//! "dirty" one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::git::{GitError, GitRepo};
use crate::throttle::LogThrottle;

/// Default prefixes of branches eligible for garbage collection.
pub const DEFAULT_CLEANUP_PREFIXES: &[&str] = &["ve/", "copilot-worktree-"];

/// Branches that are never deleted.
pub const DEFAULT_PROTECTED_BRANCHES: &[&str] = &["main", "mainnet/main"];

/// Minimum tip age before a branch may be deleted.
pub const DEFAULT_MIN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from branch operations that are not plain git failures.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error(transparent)]
    Git(#[from] GitError),
}

/// What sync did (or declined to do) for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Local and remote agree.
    UpToDate,
    /// Local commits were pushed.
    Pushed,
    /// The local ref was fast-forwarded to the remote.
    FastForwarded,
    /// Diverged branch rebased onto its remote and pushed.
    RebasedAndPushed,
    /// No matching local+remote ref pair; nothing to do.
    NoRemote,
    /// The checkout is dirty; nothing was touched.
    SkippedDirty,
    /// Diverged but not checked out anywhere, so it cannot be rebased.
    SkippedDivergedNotCheckedOut,
    /// The rebase hit conflicts and was aborted.
    SkippedRebaseConflict,
    /// A git command failed; the branch was left alone.
    Failed(String),
}

impl SyncAction {
    /// Whether the action moved the branch into sync.
    pub fn synced(&self) -> bool {
        matches!(
            self,
            Self::Pushed | Self::FastForwarded | Self::RebasedAndPushed
        )
    }
}

/// Outcome of one [`BranchManager::sync_local_tracking_branches`] pass.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// Number of branches brought into sync.
    pub synced: u64,
    /// Per-branch actions in input order.
    pub actions: Vec<(String, SyncAction)>,
}

/// Why a cleanup candidate was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Protected,
    CheckedOut,
    ActiveWorktree,
    TooRecent,
    UnpushedCommits,
    NotPushedNotMerged,
    NoCommitDate,
    DateCheckFailed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Protected => "protected",
            Self::CheckedOut => "checked-out",
            Self::ActiveWorktree => "active-worktree",
            Self::TooRecent => "too-recent",
            Self::UnpushedCommits => "unpushed-commits",
            Self::NotPushedNotMerged => "not-pushed-not-merged",
            Self::NoCommitDate => "no-commit-date",
            Self::DateCheckFailed => "date-check-failed",
        };
        f.write_str(s)
    }
}

/// Options for [`BranchManager::cleanup_stale_branches`].
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub prefixes: Vec<String>,
    pub protected_branches: Vec<String>,
    pub min_age: Duration,
    /// Log intent without deleting anything.
    pub dry_run: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_CLEANUP_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            protected_branches: DEFAULT_PROTECTED_BRANCHES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_age: DEFAULT_MIN_AGE,
            dry_run: false,
        }
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub errors: Vec<(String, String)>,
}

/// Synchronizes and garbage-collects local branches for one repository.
#[derive(Debug, Clone)]
pub struct BranchManager {
    repo: GitRepo,
    repo_lock: Arc<Mutex<()>>,
    throttle: Arc<LogThrottle>,
}

impl BranchManager {
    pub fn new(repo: GitRepo, repo_lock: Arc<Mutex<()>>, throttle: Arc<LogThrottle>) -> Self {
        Self {
            repo,
            repo_lock,
            throttle,
        }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    /// Emit a throttled log line keyed by `sync:{branch}:{event}`.
    fn log(&self, branch: &str, event: &str, message: &str) {
        let key = format!("sync:{branch}:{event}");
        if let Some(suppressed) = self.throttle.should_log(&key) {
            if suppressed > 0 {
                tracing::info!(branch, suppressed, "{message}");
            } else {
                tracing::info!(branch, "{message}");
            }
        }
    }

    fn warn(&self, branch: &str, event: &str, message: &str) {
        let key = format!("sync:{branch}:{event}");
        if let Some(suppressed) = self.throttle.should_log(&key) {
            if suppressed > 0 {
                tracing::warn!(branch, suppressed, "{message}");
            } else {
                tracing::warn!(branch, "{message}");
            }
        }
    }

    /// Bring local tracking branches into sync with `origin/*`.
    ///
    /// A single `fetch --all --prune` runs up front; if it fails the pass
    /// returns zero synced branches. Per-branch failures are recorded and
    /// do not stop the pass.
    pub async fn sync_local_tracking_branches(&self, branches: &[String]) -> SyncReport {
        let _guard = self.repo_lock.lock().await;
        let mut report = SyncReport::default();

        if let Err(e) = self.repo.fetch_all().await {
            self.warn("*", "fetch-failed", &format!("fetch --all failed: {e}"));
            return report;
        }

        for branch in branches {
            let action = match self.sync_one(branch).await {
                Ok(action) => action,
                Err(e) => {
                    self.warn(branch, "error", &format!("sync failed: {e}"));
                    SyncAction::Failed(e.to_string())
                }
            };
            if action.synced() {
                report.synced += 1;
            }
            report.actions.push((branch.clone(), action));
        }

        report
    }

    async fn sync_one(&self, branch: &str) -> Result<SyncAction, GitError> {
        if !self.repo.branch_exists(branch).await?
            || !self.repo.remote_branch_exists(branch).await?
        {
            return Ok(SyncAction::NoRemote);
        }

        let (ahead, behind) = self.repo.ahead_behind(branch).await?;
        if ahead == 0 && behind == 0 {
            return Ok(SyncAction::UpToDate);
        }

        // Locate the checkout, if any, and evaluate its dirtiness BEFORE
        // any divergence classification gets logged.
        let checkout = self.repo.worktree_for_branch(branch).await?;
        let checkout_dir: Option<PathBuf> = checkout.map(|e| e.path);
        let dirty = match &checkout_dir {
            Some(dir) => GitRepo::is_dirty_at(dir).await?,
            None => false,
        };

        if behind > 0 && dirty {
            self.log(
                branch,
                "dirty",
                "has uncommitted changes - skipping pull",
            );
            return Ok(SyncAction::SkippedDirty);
        }

        match (ahead > 0, behind > 0) {
            (false, false) => unreachable!("handled above"),
            // Ahead only: publish local commits.
            (true, false) => {
                self.repo.push_branch(branch).await?;
                self.log(branch, "pushed", "pushed local commits");
                Ok(SyncAction::Pushed)
            }
            // Diverged: rebase requires a checkout.
            (true, true) => match checkout_dir {
                None => {
                    self.warn(
                        branch,
                        "diverged-no-checkout",
                        "diverged from origin but not checked out - rebase requires checkout, skipping",
                    );
                    Ok(SyncAction::SkippedDivergedNotCheckedOut)
                }
                Some(dir) => {
                    self.log(branch, "diverged", "diverged from origin, rebasing");
                    let upstream = format!("origin/{branch}");
                    let rebase =
                        GitRepo::run_in(&dir, &["rebase", &upstream], crate::git::REBASE_TIMEOUT)
                            .await;
                    match rebase {
                        Ok(_) => {
                            self.repo.push_branch(branch).await?;
                            self.log(branch, "rebased", "rebased and pushed");
                            Ok(SyncAction::RebasedAndPushed)
                        }
                        Err(e) => {
                            let _ = GitRepo::run_in(
                                &dir,
                                &["rebase", "--abort"],
                                crate::git::REMOVAL_TIMEOUT,
                            )
                            .await;
                            self.warn(
                                branch,
                                "rebase-conflict",
                                &format!("rebase failed, aborted: {e}"),
                            );
                            Ok(SyncAction::SkippedRebaseConflict)
                        }
                    }
                }
            },
            // Behind only: fast forward.
            (false, true) => match checkout_dir {
                Some(dir) => {
                    GitRepo::run_in(
                        &dir,
                        &["pull", "--ff-only", "--quiet"],
                        crate::git::PUSH_TIMEOUT,
                    )
                    .await?;
                    self.log(branch, "ff", "fast-forwarded checkout");
                    Ok(SyncAction::FastForwarded)
                }
                None => {
                    self.repo
                        .update_ref(branch, &format!("refs/remotes/origin/{branch}"))
                        .await?;
                    self.log(branch, "ff", "fast-forwarded ref");
                    Ok(SyncAction::FastForwarded)
                }
            },
        }
    }

    /// Delete stale task branches.
    ///
    /// A branch is deleted only when all of the following hold: it
    /// matches a cleanup prefix, is not protected, is not checked out
    /// anywhere, its tip is older than `min_age`, and it is either fully
    /// pushed (`origin/B` exists with zero local-only commits) or, when
    /// no remote ref exists, fully merged into `main`. Everything else
    /// is skipped with a typed reason.
    pub async fn cleanup_stale_branches(&self, opts: &CleanupOptions) -> CleanupReport {
        let _guard = self.repo_lock.lock().await;
        let mut report = CleanupReport::default();

        let branches = match self.repo.list_local_branches().await {
            Ok(branches) => branches,
            Err(e) => {
                self.warn("*", "cleanup-list-failed", &format!("cannot list branches: {e}"));
                return report;
            }
        };

        let current = match self.repo.current_branch().await {
            Ok(current) => current,
            Err(e) => {
                report.errors.push(("*".into(), e.to_string()));
                return report;
            }
        };

        let worktree_branches: Vec<String> = match self.repo.worktree_list().await {
            Ok(entries) => entries.into_iter().filter_map(|e| e.branch).collect(),
            Err(e) => {
                report.errors.push(("*".into(), e.to_string()));
                return report;
            }
        };

        let now = Utc::now().timestamp();
        let min_age_secs = opts.min_age.as_secs() as i64;

        for branch in branches {
            if !opts.prefixes.iter().any(|p| branch.starts_with(p.as_str())) {
                continue;
            }

            if opts.protected_branches.iter().any(|p| p == &branch) {
                report.skipped.push((branch, SkipReason::Protected));
                continue;
            }
            if current.as_deref() == Some(branch.as_str()) {
                report.skipped.push((branch, SkipReason::CheckedOut));
                continue;
            }
            if worktree_branches.iter().any(|b| b == &branch) {
                report.skipped.push((branch, SkipReason::ActiveWorktree));
                continue;
            }

            let tip_epoch = match self.repo.last_commit_epoch(&branch).await {
                Err(_) => {
                    report.skipped.push((branch, SkipReason::DateCheckFailed));
                    continue;
                }
                Ok(None) => {
                    report.skipped.push((branch, SkipReason::NoCommitDate));
                    continue;
                }
                Ok(Some(epoch)) => epoch,
            };
            if now - tip_epoch < min_age_secs {
                report.skipped.push((branch, SkipReason::TooRecent));
                continue;
            }

            let deletable = match self.is_deletable(&branch).await {
                Ok(result) => result,
                Err(e) => {
                    report.errors.push((branch, e.to_string()));
                    continue;
                }
            };
            match deletable {
                Err(reason) => report.skipped.push((branch, reason)),
                Ok(()) => {
                    if opts.dry_run {
                        tracing::info!(branch = %branch, "dry-run: would delete stale branch");
                        report.deleted.push(branch);
                    } else {
                        match self.repo.delete_branch(&branch).await {
                            Ok(()) => {
                                tracing::info!(branch = %branch, "deleted stale branch");
                                report.deleted.push(branch);
                            }
                            Err(e) => report.errors.push((branch, e.to_string())),
                        }
                    }
                }
            }
        }

        report
    }

    /// Check the pushed/merged condition for a cleanup candidate.
    async fn is_deletable(&self, branch: &str) -> Result<Result<(), SkipReason>, GitError> {
        if self.repo.remote_branch_exists(branch).await? {
            let ahead = self
                .repo
                .rev_list_count(&format!("origin/{branch}..{branch}"))
                .await?;
            if ahead == 0 {
                Ok(Ok(()))
            } else {
                Ok(Err(SkipReason::UnpushedCommits))
            }
        } else if self.repo.is_merged_into(branch, "main").await? {
            Ok(Ok(()))
        } else {
            Ok(Err(SkipReason::NotPushedNotMerged))
        }
    }
}
