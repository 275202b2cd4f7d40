//! Shared test utilities for bosun integration tests.
//!
//! Provides throwaway SQLite databases (one file per test, inside a
//! `TempDir` the caller must keep alive) and scratch git repositories
//! with an `origin` remote for exercising branch and worktree code.

use std::path::{Path, PathBuf};
use std::process::Command;

use sqlx::SqlitePool;
use tempfile::TempDir;

use bosun_db::config::DbConfig;
use bosun_db::pool;

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`. The database file lives inside `dir`; hold the
/// `TempDir` for as long as the pool is in use.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = DbConfig::in_config_dir(dir.path());

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (pool, dir)
}

/// Run a git command in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Initialize a git repository with one commit on `main`.
///
/// Returns the TempDir (must be held alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    git(&repo_path, &["init", "--initial-branch=main"]);
    git(&repo_path, &["config", "user.email", "test@bosun.dev"]);
    git(&repo_path, &["config", "user.name", "Bosun Test"]);

    std::fs::write(repo_path.join("README.md"), "# Test repo\n")
        .expect("failed to write README");
    git(&repo_path, &["add", "."]);
    git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Initialize a repo plus a bare `origin` remote it pushes `main` to.
///
/// Returns `(workdir temp, repo path, origin temp, origin path)`.
pub fn create_temp_repo_with_origin() -> (TempDir, PathBuf, TempDir, PathBuf) {
    let (dir, repo_path) = create_temp_repo();

    let origin_dir = TempDir::new().expect("failed to create origin dir");
    let origin_path = origin_dir.path().to_path_buf();
    git(&origin_path, &["init", "--bare", "--initial-branch=main"]);

    git(
        &repo_path,
        &["remote", "add", "origin", &origin_path.to_string_lossy()],
    );
    git(&repo_path, &["push", "-u", "origin", "main"]);

    (dir, repo_path, origin_dir, origin_path)
}

/// Create a commit in `repo` touching `file_name`, with a fixed author
/// and committer date when `date` is given (RFC2822 or git-approxidate).
///
/// The committer date matters: branch-age checks read `%ct`, not the
/// author date.
pub fn commit_file(repo: &Path, file_name: &str, contents: &str, message: &str, date: Option<&str>) {
    std::fs::write(repo.join(file_name), contents).expect("failed to write file");
    git(repo, &["add", file_name]);

    let mut cmd = Command::new("git");
    cmd.args(["commit", "-m", message]).current_dir(repo);
    if let Some(d) = date {
        cmd.env("GIT_AUTHOR_DATE", d).env("GIT_COMMITTER_DATE", d);
    }
    let output = cmd.output().expect("git commit failed to spawn");
    assert!(
        output.status.success(),
        "git commit failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
