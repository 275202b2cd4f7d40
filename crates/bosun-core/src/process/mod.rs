//! OS process enumeration and termination.
//!
//! The maintenance sweeper and the lock manager both need to answer the
//! same questions: which processes exist, what were they started as, and
//! when. The answers come from `ps` on POSIX and `Get-CimInstance` on
//! Windows, behind one object-safe trait selected at startup.

pub mod classify;
#[cfg(unix)]
pub mod posix;
pub mod windows;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from process enumeration or termination.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The platform enumeration command failed to spawn.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The platform enumeration command exited non-zero.
    #[error("{command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Output from the platform command could not be parsed.
    #[error("failed to parse process listing: {0}")]
    Parse(String),
}

/// One enumerated OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Full command line as reported by the platform; may be empty when
    /// the platform withholds it.
    pub command_line: String,
    /// Process start time, when the platform reports one we can parse.
    pub started_at: Option<DateTime<Utc>>,
}

/// Platform adapter for process enumeration.
///
/// Killing an already-absent process is success, not an error: the sweep
/// races with natural process exit by design.
#[async_trait]
pub trait ProcessEnum: Send + Sync {
    /// Enumerate all visible processes.
    async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError>;

    /// Forcibly terminate a process (SIGKILL / `taskkill /F`).
    async fn kill(&self, pid: u32) -> Result<(), ProcessError>;

    /// Check whether a PID currently refers to a live process.
    async fn is_alive(&self, pid: u32) -> bool;
}

// Compile-time assertion: ProcessEnum must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ProcessEnum) {}
};

/// Select the enumerator for the current platform.
pub fn platform_default() -> Arc<dyn ProcessEnum> {
    #[cfg(unix)]
    {
        Arc::new(posix::PosixProcessEnum::new())
    }
    #[cfg(not(unix))]
    {
        Arc::new(windows::WindowsProcessEnum::new())
    }
}
