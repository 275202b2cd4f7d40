//! Singleton enforcement over a config directory.
//!
//! One orchestrator instance per config directory, enforced through a
//! `bosun.pid` lock file. The file carries an identity token so that a
//! recycled PID can never masquerade as the owner: the current process
//! owns the lock iff the recorded pid is its own AND the recorded token
//! matches the one generated at startup. Legacy files written before the
//! token existed (bare integer, or JSON without `lock_token`) are matched
//! by process start time instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::process::classify::{
    CmdlineClass, classify, should_assume_monitor_for_unknown_owner,
};
use crate::process::{ProcessEnum, ProcessInfo};
use crate::throttle;

/// Lock file name inside the config directory.
pub const LOCK_FILE_NAME: &str = "bosun.pid";

/// Sibling file holding duplicate-start warn-throttle state.
pub const WARN_STATE_FILE_NAME: &str = "monitor-duplicate-start-warning-state.json";

/// Environment variable overriding the duplicate-start warn window (ms).
pub const WARN_THROTTLE_ENV: &str = "MONITOR_DUPLICATE_START_WARN_THROTTLE_MS";

/// Tolerance when matching a recorded start time against the enumerated
/// process start time (clock granularity of `ps` is one second; allow
/// scheduling slop on top).
const START_TIME_TOLERANCE: ChronoDuration = ChronoDuration::seconds(5);

const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// On-disk lock payload. Writers always produce the JSON form; readers
/// additionally accept a legacy bare-integer PID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFilePayload {
    pub pid: u32,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub lock_token: Option<Uuid>,
}

impl LockFilePayload {
    /// Parse a lock file body: JSON first, then the legacy bare integer.
    pub fn parse(contents: &str) -> Option<Self> {
        if let Ok(payload) = serde_json::from_str::<Self>(contents) {
            return Some(payload);
        }
        let pid = contents.trim().parse::<u32>().ok()?;
        Some(Self {
            pid,
            started_at: None,
            argv: Vec::new(),
            lock_token: None,
        })
    }
}

/// Persisted duplicate-start warn-throttle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WarnState {
    pid: u32,
    last_logged_at: DateTime<Utc>,
    suppressed: u64,
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// This process now holds (or already held) the lock.
    Acquired,
    /// The lock could not be written for a reason other than contention;
    /// the orchestrator continues without singleton protection.
    AcquiredUnlocked,
    /// Another live bosun owns the directory.
    AlreadyRunning { pid: u32 },
}

/// Errors from lock management.
#[derive(Debug, Error)]
pub enum LockError {
    /// A stale or reused lock file could not be removed after repeated
    /// attempts. The only fatal lock error.
    #[error("failed to remove stale lock file {path} after {attempts} attempts: {source}")]
    UnlinkFailed {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("failed to read lock file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the classifier decided about an existing lock owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerDecision {
    /// The lock is our own (re-entrant acquire).
    Reentrant,
    /// A live monitor owns it; back off.
    LiveMonitor,
    /// The PID was recycled by an unrelated process; replace the file.
    PidReuse,
    /// The recorded process is gone; replace the file.
    Dead,
}

/// Singleton lock over one config directory.
pub struct LockManager {
    config_dir: PathBuf,
    token: Uuid,
    process_enum: Arc<dyn ProcessEnum>,
    warn_window: std::time::Duration,
    holds_lock: AtomicBool,
}

impl LockManager {
    pub fn new(config_dir: impl Into<PathBuf>, process_enum: Arc<dyn ProcessEnum>) -> Self {
        let warn_window = std::env::var(WARN_THROTTLE_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|ms| std::time::Duration::from_millis(ms.max(5000)))
            .unwrap_or(throttle::DUPLICATE_START_DEFAULT);

        Self {
            config_dir: config_dir.into(),
            token: Uuid::new_v4(),
            process_enum,
            warn_window,
            holds_lock: AtomicBool::new(false),
        }
    }

    /// The identity token generated for this process at startup.
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config_dir.join(LOCK_FILE_NAME)
    }

    fn warn_state_path(&self) -> PathBuf {
        self.config_dir.join(WARN_STATE_FILE_NAME)
    }

    /// Attempt to become the single orchestrator for the config directory.
    pub async fn acquire(&self) -> Result<Acquisition, LockError> {
        let path = self.lock_path();
        if let Err(e) = std::fs::create_dir_all(&self.config_dir) {
            tracing::warn!(
                dir = %self.config_dir.display(),
                error = %e,
                "cannot create config directory; continuing without lock"
            );
            return Ok(Acquisition::AcquiredUnlocked);
        }

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            match self.try_exclusive_write(&path) {
                Ok(()) => {
                    self.holds_lock.store(true, Ordering::SeqCst);
                    tracing::debug!(path = %path.display(), "lock acquired");
                    return Ok(Acquisition::Acquired);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.decide_existing(&path).await? {
                        OwnerDecision::Reentrant => {
                            self.holds_lock.store(true, Ordering::SeqCst);
                            return Ok(Acquisition::Acquired);
                        }
                        OwnerDecision::LiveMonitor => {
                            let pid = self.read_payload(&path)?.map(|p| p.pid).unwrap_or(0);
                            self.warn_duplicate_start(pid);
                            return Ok(Acquisition::AlreadyRunning { pid });
                        }
                        OwnerDecision::PidReuse | OwnerDecision::Dead => {
                            if let Err(unlink_err) = std::fs::remove_file(&path) {
                                if unlink_err.kind() == std::io::ErrorKind::NotFound {
                                    continue;
                                }
                                if attempt == MAX_ACQUIRE_ATTEMPTS {
                                    return Err(LockError::UnlinkFailed {
                                        path,
                                        attempts: MAX_ACQUIRE_ATTEMPTS,
                                        source: unlink_err,
                                    });
                                }
                                tracing::warn!(
                                    path = %path.display(),
                                    error = %unlink_err,
                                    "failed to unlink stale lock; retrying"
                                );
                            } else {
                                tracing::warn!(
                                    path = %path.display(),
                                    "replaced stale lock file"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    // Any non-EEXIST write error is non-fatal.
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to write lock file; continuing without lock"
                    );
                    return Ok(Acquisition::AcquiredUnlocked);
                }
            }
        }

        // Three rounds of unlink+create lost the race each time: someone
        // else is winning; treat it as contention.
        let pid = self.read_payload(&path)?.map(|p| p.pid).unwrap_or(0);
        Ok(Acquisition::AlreadyRunning { pid })
    }

    /// Remove the lock file iff this process still owns it. Safe to call
    /// multiple times and from signal-driven shutdown paths.
    pub fn release_if_owner(&self) {
        if !self.holds_lock.swap(false, Ordering::SeqCst) {
            return;
        }
        let path = self.lock_path();
        match self.read_payload(&path) {
            Ok(Some(payload)) if self.payload_is_self(&payload) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove lock file");
                }
            }
            _ => {
                // Someone replaced the file; it is not ours to remove.
            }
        }
    }

    /// Read and report the current lock owner, if any.
    pub fn status(&self) -> Result<Option<LockFilePayload>, LockError> {
        self.read_payload(&self.lock_path())
    }

    /// Whether this process currently believes it holds the lock.
    pub fn holds_lock(&self) -> bool {
        self.holds_lock.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------

    fn try_exclusive_write(&self, path: &Path) -> std::io::Result<()> {
        use std::io::Write;

        let payload = LockFilePayload {
            pid: std::process::id(),
            started_at: Some(Utc::now().to_rfc3339()),
            argv: std::env::args().collect(),
            lock_token: Some(self.token),
        };
        let body = serde_json::to_string_pretty(&payload)
            .map_err(|e| std::io::Error::other(e))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(body.as_bytes())?;
        Ok(())
    }

    fn read_payload(&self, path: &Path) -> Result<Option<LockFilePayload>, LockError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LockError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        Ok(LockFilePayload::parse(&contents))
    }

    fn payload_is_self(&self, payload: &LockFilePayload) -> bool {
        payload.pid == std::process::id() && payload.lock_token == Some(self.token)
    }

    async fn decide_existing(&self, path: &Path) -> Result<OwnerDecision, LockError> {
        let Some(payload) = self.read_payload(path)? else {
            // Deleted between create and read: retry the create.
            return Ok(OwnerDecision::Dead);
        };

        if self.payload_is_self(&payload) {
            return Ok(OwnerDecision::Reentrant);
        }

        // Unparseable files land here as well: `parse` returned None and
        // we already returned Dead above via the read path, so a Some
        // payload always has at least a pid.
        if !self.process_enum.is_alive(payload.pid).await {
            return Ok(OwnerDecision::Dead);
        }

        let proc = self.find_process(payload.pid).await;
        Ok(decide_live_owner(&payload, proc.as_ref(), Utc::now()))
    }

    async fn find_process(&self, pid: u32) -> Option<ProcessInfo> {
        match self.process_enum.list().await {
            Ok(list) => list.into_iter().find(|p| p.pid == pid),
            Err(e) => {
                tracing::warn!(error = %e, "process enumeration failed during lock check");
                None
            }
        }
    }

    /// Emit a throttled "another bosun is already running" warning.
    ///
    /// The throttle state lives on disk because every duplicate start is
    /// a fresh process; an in-memory map would never suppress anything.
    fn warn_duplicate_start(&self, pid: u32) {
        let state_path = self.warn_state_path();
        let now = Utc::now();
        let window = ChronoDuration::from_std(self.warn_window).unwrap_or(ChronoDuration::seconds(60));

        let previous: Option<WarnState> = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok());

        let (should_log, suppressed) = match &previous {
            Some(state) if state.pid == pid => {
                if now.signed_duration_since(state.last_logged_at) < window {
                    (false, state.suppressed + 1)
                } else {
                    (true, state.suppressed)
                }
            }
            _ => (true, 0),
        };

        let new_state = if should_log {
            if suppressed > 0 {
                tracing::warn!(
                    pid,
                    suppressed,
                    "another bosun is already running (PID {pid}); {suppressed} duplicate starts suppressed since last warning"
                );
            } else {
                tracing::warn!(pid, "another bosun is already running (PID {pid})");
            }
            WarnState {
                pid,
                last_logged_at: now,
                suppressed: 0,
            }
        } else {
            WarnState {
                pid,
                last_logged_at: previous.map(|s| s.last_logged_at).unwrap_or(now),
                suppressed,
            }
        };

        if let Ok(body) = serde_json::to_string_pretty(&new_state) {
            if let Err(e) = std::fs::write(&state_path, body) {
                tracing::debug!(error = %e, "failed to persist duplicate-start warn state");
            }
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release_if_owner();
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config_dir", &self.config_dir)
            .field("holds_lock", &self.holds_lock.load(Ordering::SeqCst))
            .finish()
    }
}

/// Classify a live process that holds the lock.
///
/// Pure so the matrix is testable without real processes:
/// - enumerated command line classifies as monitor, with start time
///   consistent with the payload -> live monitor;
/// - monitor classification but mismatched start time -> the metadata is
///   stale, the PID was recycled by a *different* monitor -> reuse;
/// - `other` classification -> reuse;
/// - unknown command line -> fall back to the payload's argv and the
///   3-minute freshness heuristic.
fn decide_live_owner(
    payload: &LockFilePayload,
    proc: Option<&ProcessInfo>,
    now: DateTime<Utc>,
) -> OwnerDecision {
    let class = proc
        .map(|p| classify(&p.command_line))
        .unwrap_or(CmdlineClass::Unknown);

    match class {
        CmdlineClass::Monitor => {
            if start_time_is_stale(payload, proc) {
                OwnerDecision::PidReuse
            } else {
                OwnerDecision::LiveMonitor
            }
        }
        CmdlineClass::Other => OwnerDecision::PidReuse,
        CmdlineClass::Unknown => {
            if should_assume_monitor_for_unknown_owner(
                &payload.argv,
                payload.started_at.as_deref(),
                now,
            ) {
                OwnerDecision::LiveMonitor
            } else {
                OwnerDecision::PidReuse
            }
        }
    }
}

/// Whether the payload's recorded start time contradicts the enumerated
/// process start time. Missing data on either side is not a
/// contradiction.
fn start_time_is_stale(payload: &LockFilePayload, proc: Option<&ProcessInfo>) -> bool {
    let (Some(recorded), Some(actual)) = (
        payload
            .started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc)),
        proc.and_then(|p| p.started_at),
    ) else {
        return false;
    };

    // The lock is written shortly after process start; the recorded time
    // must not be *earlier* than the actual start by more than tolerance,
    // and a recorded time far in the process's past means the file
    // predates the process (PID reuse).
    let diff = recorded.signed_duration_since(actual);
    diff < -START_TIME_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;
    use async_trait::async_trait;

    /// Process enumerator backed by a fixed list.
    struct FakeProcessEnum {
        processes: Vec<ProcessInfo>,
    }

    #[async_trait]
    impl ProcessEnum for FakeProcessEnum {
        async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
            Ok(self.processes.clone())
        }

        async fn kill(&self, _pid: u32) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.processes.iter().any(|p| p.pid == pid)
        }
    }

    fn manager_with(processes: Vec<ProcessInfo>) -> (LockManager, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = LockManager::new(dir.path(), Arc::new(FakeProcessEnum { processes }));
        (mgr, dir)
    }

    fn monitor_payload(pid: u32, started_at: &str) -> LockFilePayload {
        LockFilePayload {
            pid,
            started_at: Some(started_at.to_string()),
            argv: vec!["node".into(), "monitor.mjs".into()],
            lock_token: None,
        }
    }

    #[test]
    fn parses_json_payload() {
        let body = r#"{"pid": 42, "started_at": "2026-01-01T00:00:00Z", "argv": ["node", "monitor.mjs"], "lock_token": "6f2b8f64-2e1c-4f7a-9d3e-111111111111"}"#;
        let payload = LockFilePayload::parse(body).unwrap();
        assert_eq!(payload.pid, 42);
        assert!(payload.lock_token.is_some());
    }

    #[test]
    fn parses_legacy_bare_integer() {
        let payload = LockFilePayload::parse("  1234\n").unwrap();
        assert_eq!(payload.pid, 1234);
        assert_eq!(payload.lock_token, None);
        assert!(payload.argv.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(LockFilePayload::parse("not a lock").is_none());
    }

    #[test]
    fn live_monitor_owner_is_contention() {
        let now = Utc::now();
        let payload = monitor_payload(99, &now.to_rfc3339());
        let proc = ProcessInfo {
            pid: 99,
            command_line: "node /opt/bosun/monitor.mjs".into(),
            started_at: Some(now),
        };
        assert_eq!(
            decide_live_owner(&payload, Some(&proc), now),
            OwnerDecision::LiveMonitor
        );
    }

    #[test]
    fn other_process_is_pid_reuse() {
        let now = Utc::now();
        let payload = monitor_payload(99, &now.to_rfc3339());
        let proc = ProcessInfo {
            pid: 99,
            command_line: "postgres -D /var/lib".into(),
            started_at: Some(now),
        };
        assert_eq!(
            decide_live_owner(&payload, Some(&proc), now),
            OwnerDecision::PidReuse
        );
    }

    #[test]
    fn stale_monitor_metadata_is_pid_reuse() {
        let now = Utc::now();
        // Lock written an hour before the live process started: the file
        // belongs to a previous incarnation of the PID.
        let recorded = now - ChronoDuration::hours(1);
        let payload = monitor_payload(99, &recorded.to_rfc3339());
        let proc = ProcessInfo {
            pid: 99,
            command_line: "node monitor.mjs".into(),
            started_at: Some(now),
        };
        assert_eq!(
            decide_live_owner(&payload, Some(&proc), now),
            OwnerDecision::PidReuse
        );
    }

    #[test]
    fn unknown_cmdline_recent_monitor_argv_is_contention() {
        let now = Utc::now();
        let payload = monitor_payload(99, &(now - ChronoDuration::seconds(30)).to_rfc3339());
        assert_eq!(
            decide_live_owner(&payload, None, now),
            OwnerDecision::LiveMonitor
        );
    }

    #[test]
    fn unknown_cmdline_old_start_is_pid_reuse() {
        let now = Utc::now();
        let payload = monitor_payload(99, &(now - ChronoDuration::hours(2)).to_rfc3339());
        assert_eq!(
            decide_live_owner(&payload, None, now),
            OwnerDecision::PidReuse
        );
    }

    #[tokio::test]
    async fn acquire_fresh_directory() {
        let (mgr, dir) = manager_with(vec![]);
        assert_eq!(mgr.acquire().await.unwrap(), Acquisition::Acquired);
        assert!(dir.path().join(LOCK_FILE_NAME).exists());

        let payload = mgr.status().unwrap().unwrap();
        assert_eq!(payload.pid, std::process::id());
        assert_eq!(payload.lock_token, Some(mgr.token()));
    }

    #[tokio::test]
    async fn acquire_is_reentrant() {
        let (mgr, _dir) = manager_with(vec![]);
        assert_eq!(mgr.acquire().await.unwrap(), Acquisition::Acquired);
        assert_eq!(mgr.acquire().await.unwrap(), Acquisition::Acquired);
    }

    #[tokio::test]
    async fn acquire_replaces_dead_owner() {
        let (mgr, dir) = manager_with(vec![]);
        let stale = serde_json::json!({
            "pid": 2147483647u32,
            "started_at": "1999-01-01T00:00:00Z",
            "argv": ["node", "monitor.mjs"],
        });
        std::fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_string_pretty(&stale).unwrap(),
        )
        .unwrap();

        assert_eq!(mgr.acquire().await.unwrap(), Acquisition::Acquired);
        let payload = mgr.status().unwrap().unwrap();
        assert_eq!(payload.pid, std::process::id());
        assert_eq!(payload.lock_token, Some(mgr.token()));
    }

    #[tokio::test]
    async fn acquire_backs_off_from_live_monitor() {
        let now = Utc::now();
        let (mgr, dir) = manager_with(vec![ProcessInfo {
            pid: 4242,
            command_line: "node /opt/bosun/monitor.mjs".into(),
            started_at: Some(now),
        }]);
        let owner = serde_json::json!({
            "pid": 4242,
            "started_at": now.to_rfc3339(),
            "argv": ["node", "/opt/bosun/monitor.mjs"],
        });
        std::fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_string(&owner).unwrap(),
        )
        .unwrap();

        assert_eq!(
            mgr.acquire().await.unwrap(),
            Acquisition::AlreadyRunning { pid: 4242 }
        );
        // A warn-state file is persisted for throttling.
        assert!(dir.path().join(WARN_STATE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn duplicate_start_warning_is_throttled_on_disk() {
        let now = Utc::now();
        let (mgr, dir) = manager_with(vec![ProcessInfo {
            pid: 4242,
            command_line: "node monitor.mjs".into(),
            started_at: Some(now),
        }]);
        std::fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_string(&serde_json::json!({
                "pid": 4242,
                "started_at": now.to_rfc3339(),
                "argv": ["node", "monitor.mjs"],
            }))
            .unwrap(),
        )
        .unwrap();

        for _ in 0..3 {
            let _ = mgr.acquire().await.unwrap();
        }

        let state: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(WARN_STATE_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(state["pid"], 4242);
        // First acquire logged; the two repeats inside the window were
        // suppressed.
        assert_eq!(state["suppressed"], 2);
    }

    #[tokio::test]
    async fn release_only_removes_own_file() {
        let (mgr, dir) = manager_with(vec![]);
        assert_eq!(mgr.acquire().await.unwrap(), Acquisition::Acquired);

        // Simulate a takeover: another process replaced the lock.
        std::fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_string(&serde_json::json!({
                "pid": 77,
                "argv": [],
                "lock_token": Uuid::new_v4(),
            }))
            .unwrap(),
        )
        .unwrap();

        mgr.release_if_owner();
        assert!(
            dir.path().join(LOCK_FILE_NAME).exists(),
            "a foreign lock file must not be removed"
        );
    }

    #[tokio::test]
    async fn release_removes_own_file() {
        let (mgr, dir) = manager_with(vec![]);
        assert_eq!(mgr.acquire().await.unwrap(), Acquisition::Acquired);
        mgr.release_if_owner();
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }
}
