//! Per-attempt git worktree lifecycle.
//!
//! Each task attempt runs in its own worktree under
//! `{repo_root}/.cache/worktrees/{attempt_token}`, sharing the object
//! store with the main repository but with an independent working
//! directory and index. Worktrees are ephemeral: removed when the
//! attempt terminates, pruned when their directory vanishes, and
//! garbage-collected by age for the legacy copilot daily pattern.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::git::{GitError, GitRepo};

/// Directory under the repo root that holds attempt worktrees.
pub const WORKTREE_SUBDIR: &str = ".cache/worktrees";

/// Prefix of the legacy daily copilot worktrees.
pub const COPILOT_PREFIX: &str = "copilot-worktree-";

/// Age after which a copilot daily worktree is removed.
pub const COPILOT_MAX_AGE_DAYS: i64 = 7;

/// Errors from worktree management.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),

    /// The expected worktree path exists but belongs to another branch.
    #[error("worktree at {path} has branch {found:?}, expected {expected}")]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        found: Option<String>,
    },

    #[error("failed to prepare worktree directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A live worktree allocated for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub repo_root: PathBuf,
    pub branch: String,
    pub path: PathBuf,
    pub task_attempt: Uuid,
}

/// Summary of a [`WorktreeManager::prune_stale`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Entries force-removed because their directory vanished.
    pub missing_removed: u64,
    /// Legacy copilot worktrees removed by age.
    pub aged_removed: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.missing_removed + self.aged_removed
    }
}

/// Manages attempt worktrees for one repository.
///
/// Git serializes worktree mutations through a lock file on the shared
/// object store; racing it produces spurious failures. All mutations on
/// one repo therefore go through the shared per-repo mutex, which the
/// [`crate::branch::BranchManager`] for the same repo also holds.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo: GitRepo,
    repo_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Create a manager sharing `repo_lock` with other per-repo actors.
    pub fn new(repo: GitRepo, repo_lock: Arc<Mutex<()>>) -> Self {
        Self { repo, repo_lock }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    /// Path a given attempt's worktree will live at.
    pub fn path_for(&self, attempt: Uuid) -> PathBuf {
        self.repo
            .root()
            .join(WORKTREE_SUBDIR)
            .join(attempt.to_string())
    }

    /// Conventional branch name for an attempt.
    pub fn branch_for(attempt: Uuid) -> String {
        format!("ve/{}", attempt.simple())
    }

    /// Allocate the worktree for a task attempt, creating a fresh branch
    /// off `base_branch`.
    ///
    /// Idempotent by attempt id: if the worktree already exists with the
    /// expected branch it is returned as-is.
    pub async fn allocate(
        &self,
        attempt: Uuid,
        base_branch: &str,
    ) -> Result<Worktree, WorktreeError> {
        let _guard = self.repo_lock.lock().await;

        let path = self.path_for(attempt);
        let branch = Self::branch_for(attempt);

        if let Some(existing) = self.find_by_path(&path).await? {
            if existing.branch.as_deref() == Some(branch.as_str()) {
                tracing::info!(
                    path = %path.display(),
                    branch = %branch,
                    "worktree already exists, returning existing"
                );
                return Ok(Worktree {
                    repo_root: self.repo.root().to_path_buf(),
                    branch,
                    path,
                    task_attempt: attempt,
                });
            }
            return Err(WorktreeError::BranchMismatch {
                path,
                expected: branch,
                found: existing.branch,
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let branch_exists = self.repo.branch_exists(&branch).await?;
        let result = if branch_exists {
            self.repo.worktree_add(&path, &branch, None).await
        } else {
            self.repo
                .worktree_add(&path, &branch, Some(base_branch))
                .await
        };

        if let Err(e) = result {
            self.cleanup_partial(&path).await;
            return Err(e.into());
        }

        Ok(Worktree {
            repo_root: self.repo.root().to_path_buf(),
            branch,
            path,
            task_attempt: attempt,
        })
    }

    /// Remove a worktree and prune the bookkeeping. Idempotent.
    pub async fn release(&self, worktree: &Worktree) -> Result<(), WorktreeError> {
        let _guard = self.repo_lock.lock().await;
        self.repo.worktree_remove(&worktree.path).await?;
        self.repo.worktree_prune().await?;
        Ok(())
    }

    /// Prune stale worktree state:
    ///
    /// 1. `git worktree prune` for entries git already knows are gone.
    /// 2. Force-remove listed worktrees whose directory no longer exists.
    /// 3. Force-remove `copilot-worktree-YYYY-MM-DD` entries older than
    ///    seven days.
    ///
    /// The root worktree is never touched.
    pub async fn prune_stale(&self) -> Result<PruneReport, WorktreeError> {
        let _guard = self.repo_lock.lock().await;
        let mut report = PruneReport::default();

        self.repo.worktree_prune().await?;

        let root = self
            .repo
            .root()
            .canonicalize()
            .unwrap_or_else(|_| self.repo.root().to_path_buf());
        let today = Utc::now().date_naive();

        for entry in self.repo.worktree_list().await? {
            let canonical = entry
                .path
                .canonicalize()
                .unwrap_or_else(|_| entry.path.clone());
            if canonical == root {
                continue;
            }

            if !entry.path.exists() {
                tracing::info!(
                    path = %entry.path.display(),
                    "removing worktree entry with missing directory"
                );
                self.repo.worktree_remove(&entry.path).await?;
                report.missing_removed += 1;
                continue;
            }

            let dir_name = entry
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if let Some(date) = parse_copilot_date(dir_name) {
                let age_days = (today - date).num_days();
                if age_days > COPILOT_MAX_AGE_DAYS {
                    tracing::info!(
                        path = %entry.path.display(),
                        age_days,
                        "removing aged copilot worktree"
                    );
                    self.repo.worktree_remove(&entry.path).await?;
                    report.aged_removed += 1;
                }
            }
        }

        self.repo.worktree_prune().await?;
        Ok(report)
    }

    /// Reset `core.bare=true` left behind on a non-bare repository.
    ///
    /// Worktree churn with older git versions can flip the flag on the
    /// parent repo, after which every worktree command fails. A repo
    /// whose root contains a `.git` entry is not bare regardless of what
    /// the config claims.
    ///
    /// Returns `true` when the flag was repaired.
    pub async fn repair_config_corruption(&self) -> Result<bool, WorktreeError> {
        let _guard = self.repo_lock.lock().await;

        let bare = self.repo.config_get("core.bare").await?;
        if bare.as_deref() != Some("true") {
            return Ok(false);
        }
        if !self.repo.root().join(".git").exists() {
            // Actually bare; leave it alone.
            return Ok(false);
        }

        tracing::warn!(
            repo = %self.repo.root().display(),
            "repairing core.bare=true on non-bare repository"
        );
        self.repo.config_set("core.bare", "false").await?;
        Ok(true)
    }

    async fn find_by_path(
        &self,
        path: &Path,
    ) -> Result<Option<crate::git::WorktreeEntry>, WorktreeError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let entries = self.repo.worktree_list().await?;
        Ok(entries.into_iter().find(|e| {
            e.path
                .canonicalize()
                .unwrap_or_else(|_| e.path.clone())
                == canonical
        }))
    }

    /// Best-effort cleanup after a failed `worktree add`.
    async fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.repo.worktree_prune().await;
    }
}

/// Parse the date out of a `copilot-worktree-YYYY-MM-DD` directory name.
fn parse_copilot_date(dir_name: &str) -> Option<NaiveDate> {
    let rest = dir_name.strip_prefix(COPILOT_PREFIX)?;
    NaiveDate::parse_from_str(rest, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_test_utils::{create_temp_repo, git};

    fn manager(repo_path: &Path) -> WorktreeManager {
        WorktreeManager::new(GitRepo::at(repo_path), Arc::new(Mutex::new(())))
    }

    #[test]
    fn copilot_date_parsing() {
        assert_eq!(
            parse_copilot_date("copilot-worktree-2026-01-05"),
            NaiveDate::from_ymd_opt(2026, 1, 5)
        );
        assert_eq!(parse_copilot_date("copilot-worktree-yesterday"), None);
        assert_eq!(parse_copilot_date("ve-something"), None);
    }

    #[tokio::test]
    async fn allocate_creates_branch_and_path() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);
        let attempt = Uuid::new_v4();

        let wt = mgr.allocate(attempt, "main").await.unwrap();
        assert!(wt.path.exists());
        assert_eq!(wt.branch, format!("ve/{}", attempt.simple()));
        assert!(wt.path.starts_with(repo_path.join(WORKTREE_SUBDIR)));
        assert_ne!(wt.path, repo_path, "worktree path must never be the root");
    }

    #[tokio::test]
    async fn allocate_is_idempotent_by_attempt() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);
        let attempt = Uuid::new_v4();

        let first = mgr.allocate(attempt, "main").await.unwrap();
        let second = mgr.allocate(attempt, "main").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn release_removes_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);
        let attempt = Uuid::new_v4();

        let wt = mgr.allocate(attempt, "main").await.unwrap();
        mgr.release(&wt).await.unwrap();
        assert!(!wt.path.exists());

        // Idempotent.
        mgr.release(&wt).await.unwrap();
    }

    #[tokio::test]
    async fn prune_removes_missing_directories() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);

        let wt = mgr.allocate(Uuid::new_v4(), "main").await.unwrap();
        std::fs::remove_dir_all(&wt.path).unwrap();

        let report = mgr.prune_stale().await.unwrap();
        // `git worktree prune` itself may claim the entry first; either
        // way the listing must be clean afterwards.
        assert!(report.total() <= 1);
        let repo = GitRepo::at(&repo_path);
        let entries = repo.worktree_list().await.unwrap();
        assert!(entries.iter().all(|e| e.path != wt.path));
    }

    #[tokio::test]
    async fn prune_removes_aged_copilot_worktrees() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);

        let old_date = (Utc::now().date_naive() - chrono::Duration::days(30))
            .format("%Y-%m-%d")
            .to_string();
        let dir_name = format!("{COPILOT_PREFIX}{old_date}");
        let path = repo_path.join(WORKTREE_SUBDIR).join(&dir_name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        git(
            &repo_path,
            &[
                "worktree",
                "add",
                "-b",
                &dir_name,
                &path.to_string_lossy(),
                "main",
            ],
        );

        let report = mgr.prune_stale().await.unwrap();
        assert_eq!(report.aged_removed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn prune_keeps_fresh_copilot_worktrees() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let dir_name = format!("{COPILOT_PREFIX}{today}");
        let path = repo_path.join(WORKTREE_SUBDIR).join(&dir_name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        git(
            &repo_path,
            &[
                "worktree",
                "add",
                "-b",
                &dir_name,
                &path.to_string_lossy(),
                "main",
            ],
        );

        let report = mgr.prune_stale().await.unwrap();
        assert_eq!(report.aged_removed, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn repairs_core_bare_corruption() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = manager(&repo_path);
        let repo = GitRepo::at(&repo_path);

        assert!(!mgr.repair_config_corruption().await.unwrap());

        repo.config_set("core.bare", "true").await.unwrap();
        assert!(mgr.repair_config_corruption().await.unwrap());
        assert_eq!(
            repo.config_get("core.bare").await.unwrap().as_deref(),
            Some("false")
        );

        // Second pass is a no-op.
        assert!(!mgr.repair_config_corruption().await.unwrap());
    }
}
