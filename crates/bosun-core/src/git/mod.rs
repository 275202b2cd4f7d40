//! Thin async wrapper over the `git` CLI.
//!
//! Every operation carries a per-call timeout (ref queries 5 s, removals
//! 10 s, pushes 30 s, rebase and fetch 60 s). A timed-out child is killed
//! rather than orphaned; anything that still escapes is reaped by the
//! maintenance sweep.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Timeout for read-only ref queries.
pub const REF_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for worktree/branch removals and other small mutations.
pub const REMOVAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for pushes and pulls.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for rebases.
pub const REBASE_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for `fetch --all`.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for worktree checkouts (a full tree write).
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from git subprocess calls.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The git binary failed to spawn.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// git exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The operation exceeded its timeout and the child was killed.
    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Captured output of a successful git call.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout with surrounding whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
}

/// Handle on one git repository, addressed by its top-level directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Open a repository, verifying `root` is inside a git work tree.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, GitError> {
        let root = root.into();
        let repo = Self { root: root.clone() };
        match repo.run(&["rev-parse", "--git-dir"], REF_QUERY_TIMEOUT).await {
            Ok(_) => Ok(repo),
            Err(GitError::Exit { .. }) => Err(GitError::NotAGitRepo(root)),
            Err(e) => Err(e),
        }
    }

    /// Construct without verification (the caller already knows).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git with `args` in the repo root under `timeout`.
    ///
    /// The child is spawned with kill-on-drop, so a timeout does not
    /// leave it running.
    pub async fn run(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        Self::run_in(&self.root, args, timeout).await
    }

    /// Run git with `args` in an arbitrary directory (a worktree path).
    pub async fn run_in(
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, GitError> {
        let command = args.join(" ");

        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(dir).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| GitError::Timeout {
                command: command.clone(),
                timeout,
            })?
            .map_err(|e| GitError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    // -------------------------------------------------------------------
    // Ref queries
    // -------------------------------------------------------------------

    /// Name of the branch checked out in the root worktree, if any.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let out = self
            .run(&["branch", "--show-current"], REF_QUERY_TIMEOUT)
            .await?;
        let name = out.trimmed();
        Ok(if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        })
    }

    /// Whether `refs/heads/{name}` exists.
    pub async fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        self.ref_exists(&format!("refs/heads/{name}")).await
    }

    /// Whether `refs/remotes/origin/{name}` exists.
    pub async fn remote_branch_exists(&self, name: &str) -> Result<bool, GitError> {
        self.ref_exists(&format!("refs/remotes/origin/{name}")).await
    }

    async fn ref_exists(&self, refname: &str) -> Result<bool, GitError> {
        match self
            .run(&["rev-parse", "--verify", "--quiet", refname], REF_QUERY_TIMEOUT)
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::Exit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `git rev-list --count {range}`.
    pub async fn rev_list_count(&self, range: &str) -> Result<u64, GitError> {
        let out = self
            .run(&["rev-list", "--count", range], REF_QUERY_TIMEOUT)
            .await?;
        out.trimmed()
            .parse::<u64>()
            .map_err(|_| GitError::Exit {
                command: format!("rev-list --count {range}"),
                code: 0,
                stderr: format!("unparseable count: {:?}", out.trimmed()),
            })
    }

    /// Commits `branch` is ahead of and behind `origin/{branch}`.
    pub async fn ahead_behind(&self, branch: &str) -> Result<(u64, u64), GitError> {
        let ahead = self
            .rev_list_count(&format!("origin/{branch}..{branch}"))
            .await?;
        let behind = self
            .rev_list_count(&format!("{branch}..origin/{branch}"))
            .await?;
        Ok((ahead, behind))
    }

    /// Whether the work tree at `dir` has uncommitted changes.
    pub async fn is_dirty_at(dir: &Path) -> Result<bool, GitError> {
        let out = Self::run_in(dir, &["status", "--porcelain"], REF_QUERY_TIMEOUT).await?;
        Ok(!out.trimmed().is_empty())
    }

    /// Whether the root work tree has uncommitted changes.
    pub async fn is_dirty(&self) -> Result<bool, GitError> {
        Self::is_dirty_at(&self.root).await
    }

    /// All local branch names.
    pub async fn list_local_branches(&self) -> Result<Vec<String>, GitError> {
        let out = self
            .run(
                &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
                REF_QUERY_TIMEOUT,
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Committer timestamp (unix epoch seconds) of the branch tip.
    pub async fn last_commit_epoch(&self, branch: &str) -> Result<Option<i64>, GitError> {
        let out = match self
            .run(&["log", "-1", "--format=%ct", branch], REF_QUERY_TIMEOUT)
            .await
        {
            Ok(out) => out,
            Err(GitError::Exit { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(out.trimmed().parse::<i64>().ok())
    }

    /// Whether `branch` is an ancestor of `target` (fully merged).
    pub async fn is_merged_into(&self, branch: &str, target: &str) -> Result<bool, GitError> {
        match self
            .run(
                &["merge-base", "--is-ancestor", branch, target],
                REF_QUERY_TIMEOUT,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::Exit { code: 1, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read one config key, `None` when unset.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>, GitError> {
        match self.run(&["config", "--get", key], REF_QUERY_TIMEOUT).await {
            Ok(out) => Ok(Some(out.trimmed().to_string())),
            Err(GitError::Exit { code: 1, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Set one config key.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), GitError> {
        self.run(&["config", key, value], REF_QUERY_TIMEOUT).await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------

    /// `git fetch --all --prune --quiet`.
    pub async fn fetch_all(&self) -> Result<(), GitError> {
        self.run(&["fetch", "--all", "--prune", "--quiet"], FETCH_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Push a local branch to the same-named remote ref.
    pub async fn push_branch(&self, branch: &str) -> Result<(), GitError> {
        let refspec = format!("{branch}:refs/heads/{branch}");
        self.run(&["push", "origin", &refspec, "--quiet"], PUSH_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Fast-forward-only pull of the current branch.
    pub async fn pull_ff_only(&self) -> Result<(), GitError> {
        self.run(&["pull", "--ff-only", "--quiet"], PUSH_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Rebase the current branch onto `upstream`.
    pub async fn rebase_onto(&self, upstream: &str) -> Result<(), GitError> {
        self.run(&["rebase", upstream], REBASE_TIMEOUT).await?;
        Ok(())
    }

    /// Abort an in-progress rebase, ignoring "no rebase in progress".
    pub async fn rebase_abort(&self) -> Result<(), GitError> {
        match self.run(&["rebase", "--abort"], REMOVAL_TIMEOUT).await {
            Ok(_) | Err(GitError::Exit { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Point `refs/heads/{branch}` at `target` without touching any
    /// work tree (safe fast-forward for branches not checked out).
    pub async fn update_ref(&self, branch: &str, target: &str) -> Result<(), GitError> {
        let refname = format!("refs/heads/{branch}");
        self.run(&["update-ref", &refname, target], REF_QUERY_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Force-delete a local branch; absent branches are not an error.
    pub async fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        match self.run(&["branch", "-D", name], REMOVAL_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, code, .. }) => {
                if stderr.contains("not found") {
                    Ok(())
                } else {
                    Err(GitError::Exit {
                        command: format!("branch -D {name}"),
                        code,
                        stderr,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------
    // Worktrees
    // -------------------------------------------------------------------

    /// `git worktree add`. With `create_from = Some(base)` a new branch is
    /// created starting at `base`; otherwise the existing branch is
    /// checked out.
    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        create_from: Option<&str>,
    ) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        if let Some(base) = create_from {
            self.run(
                &["worktree", "add", "-b", branch, &path_str, base],
                CHECKOUT_TIMEOUT,
            )
            .await?;
        } else {
            self.run(&["worktree", "add", &path_str, branch], CHECKOUT_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    /// `git worktree remove --force`; already-gone worktrees succeed.
    pub async fn worktree_remove(&self, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        match self
            .run(&["worktree", "remove", "--force", &path_str], REMOVAL_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, code, .. }) => {
                if stderr.contains("is not a working tree") {
                    Ok(())
                } else {
                    Err(GitError::Exit {
                        command: "worktree remove".into(),
                        code,
                        stderr,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// `git worktree prune`.
    pub async fn worktree_prune(&self) -> Result<(), GitError> {
        self.run(&["worktree", "prune"], REMOVAL_TIMEOUT).await?;
        Ok(())
    }

    /// Parsed `git worktree list --porcelain`.
    pub async fn worktree_list(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let out = self
            .run(&["worktree", "list", "--porcelain"], REF_QUERY_TIMEOUT)
            .await?;
        Ok(parse_worktree_porcelain(&out.stdout))
    }

    /// Which worktree, if any, has `branch` checked out.
    pub async fn worktree_for_branch(
        &self,
        branch: &str,
    ) -> Result<Option<WorktreeEntry>, GitError> {
        let entries = self.worktree_list().await?;
        Ok(entries
            .into_iter()
            .find(|e| e.branch.as_deref() == Some(branch)))
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare`; detached worktrees show `detached`
/// instead of `branch`.
fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(rest),
                head: None,
                branch: None,
                bare: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(rest) = line.strip_prefix("HEAD ") {
                entry.head = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("branch ") {
                let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest);
                entry.branch = Some(branch.to_string());
            } else if line == "bare" {
                entry.bare = true;
            }
            // `detached`, `prunable`, `locked` are ignored.
        }
    }

    if let Some(entry) = current {
        entries.push(entry);
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_test_utils::{commit_file, create_temp_repo, create_temp_repo_with_origin, git};

    #[test]
    fn parse_porcelain_blocks() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/.cache/worktrees/tok-1
HEAD 789abc012def
branch refs/heads/ve/add-auth

worktree /home/user/detached
HEAD 111222333444
detached

";
        let entries = parse_worktree_porcelain(input);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("ve/add-auth"));
        assert_eq!(entries[2].branch, None);
        assert_eq!(entries[2].head.as_deref(), Some("111222333444"));
    }

    #[test]
    fn parse_porcelain_without_trailing_newline() {
        let input = "worktree /p\nHEAD abc\nbranch refs/heads/main";
        let entries = parse_worktree_porcelain(input);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_porcelain_empty() {
        assert!(parse_worktree_porcelain("").is_empty());
    }

    #[tokio::test]
    async fn open_rejects_non_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = GitRepo::open(dir.path()).await;
        assert!(matches!(result, Err(GitError::NotAGitRepo(_))));
    }

    #[tokio::test]
    async fn current_branch_and_dirty_state() {
        let (_dir, repo_path) = create_temp_repo();
        let repo = GitRepo::open(&repo_path).await.unwrap();

        assert_eq!(repo.current_branch().await.unwrap().as_deref(), Some("main"));
        assert!(!repo.is_dirty().await.unwrap());

        std::fs::write(repo_path.join("scratch.txt"), "wip").unwrap();
        assert!(repo.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn ahead_behind_counts() {
        let (_dir, repo_path, _odir, _origin) = create_temp_repo_with_origin();
        let repo = GitRepo::open(&repo_path).await.unwrap();

        assert_eq!(repo.ahead_behind("main").await.unwrap(), (0, 0));

        commit_file(&repo_path, "a.txt", "a", "feat: a", None);
        assert_eq!(repo.ahead_behind("main").await.unwrap(), (1, 0));

        repo.push_branch("main").await.unwrap();
        repo.fetch_all().await.unwrap();
        assert_eq!(repo.ahead_behind("main").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn branch_lifecycle() {
        let (_dir, repo_path) = create_temp_repo();
        let repo = GitRepo::open(&repo_path).await.unwrap();

        git(&repo_path, &["branch", "ve/test"]);
        assert!(repo.branch_exists("ve/test").await.unwrap());
        assert!(repo.is_merged_into("ve/test", "main").await.unwrap());

        repo.delete_branch("ve/test").await.unwrap();
        assert!(!repo.branch_exists("ve/test").await.unwrap());

        // Deleting again is a no-op.
        repo.delete_branch("ve/test").await.unwrap();
    }

    #[tokio::test]
    async fn config_round_trip() {
        let (_dir, repo_path) = create_temp_repo();
        let repo = GitRepo::open(&repo_path).await.unwrap();

        assert_eq!(repo.config_get("core.bare").await.unwrap().as_deref(), Some("false"));
        repo.config_set("core.bare", "true").await.unwrap();
        assert_eq!(repo.config_get("core.bare").await.unwrap().as_deref(), Some("true"));
        repo.config_set("core.bare", "false").await.unwrap();
        assert_eq!(repo.config_get("bosun.missing").await.unwrap(), None);
    }
}
