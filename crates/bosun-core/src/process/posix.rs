//! POSIX process enumeration via `ps`.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use tokio::process::Command;

use super::{ProcessEnum, ProcessError, ProcessInfo};

/// Enumerates processes by parsing `ps -eo pid,lstart,args`.
#[derive(Debug, Default)]
pub struct PosixProcessEnum;

impl PosixProcessEnum {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessEnum for PosixProcessEnum {
    async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let output = Command::new("ps")
            .args(["-eo", "pid,lstart,args"])
            .output()
            .await
            .map_err(|e| ProcessError::Spawn {
                command: "ps -eo pid,lstart,args".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Exit {
                command: "ps".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        // SAFETY: kill(2) with a plain pid and signal has no memory effects.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let errno = std::io::Error::last_os_error();
        // ESRCH: the process is already gone.
        if errno.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(ProcessError::Spawn {
            command: format!("kill -9 {pid}"),
            source: errno,
        })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything. EPERM
        // still means the process exists.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Parse `ps -eo pid,lstart,args` output.
///
/// Each data line is `PID DOW MON DD HH:MM:SS YYYY ARGS...`: the `lstart`
/// field is always exactly five whitespace-separated tokens, so the
/// command line is everything from token seven onward. Unparseable lines
/// are skipped; an unparseable date still yields the process with
/// `started_at = None`.
fn parse_ps_output(output: &str) -> Vec<ProcessInfo> {
    let mut processes = Vec::new();

    for line in output.lines().skip(1) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 7 {
            continue;
        }
        let Ok(pid) = tokens[0].parse::<u32>() else {
            continue;
        };

        let lstart = tokens[1..6].join(" ");
        let started_at = parse_lstart(&lstart);
        let command_line = tokens[6..].join(" ");

        processes.push(ProcessInfo {
            pid,
            command_line,
            started_at,
        });
    }

    processes
}

/// Parse an `lstart` timestamp like `Mon Jan  5 10:11:12 2026`.
///
/// `ps` prints local time, so the naive value is resolved against the
/// local zone before converting to UTC.
pub(crate) fn parse_lstart(lstart: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(lstart.trim(), "%a %b %e %H:%M:%S %Y").ok()?;
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            Some(dt.with_timezone(&Utc))
        }
        chrono::LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_ps_lines() {
        let output = "\
    PID                  STARTED COMMAND
      1 Mon Jan  5 10:11:12 2026 /sbin/init
  14203 Tue Feb 10 09:00:01 2026 node /opt/bosun/monitor.mjs --managed
  14305 Tue Feb 10 09:00:05 2026 git push origin main
";
        let procs = parse_ps_output(output);
        assert_eq!(procs.len(), 3);

        assert_eq!(procs[0].pid, 1);
        assert_eq!(procs[0].command_line, "/sbin/init");
        assert!(procs[0].started_at.is_some());

        assert_eq!(procs[1].pid, 14203);
        assert_eq!(procs[1].command_line, "node /opt/bosun/monitor.mjs --managed");

        assert_eq!(procs[2].command_line, "git push origin main");
    }

    #[test]
    fn skips_malformed_lines() {
        let output = "PID STARTED COMMAND\ngarbage\n  12 not a date at all here cmd\n";
        let procs = parse_ps_output(output);
        // The second line has enough tokens but an unparseable date; the
        // process itself still appears.
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 12);
        assert!(procs[0].started_at.is_none());
    }

    #[test]
    fn lstart_round_trip() {
        let parsed = parse_lstart("Mon Jan  5 10:11:12 2026").expect("should parse");
        let local = parsed.with_timezone(&Local);
        assert_eq!(local.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-05 10:11:12");
    }

    #[test]
    fn lstart_rejects_garbage() {
        assert!(parse_lstart("not a date").is_none());
    }

    #[tokio::test]
    async fn lists_at_least_self() {
        let enumerator = PosixProcessEnum::new();
        let procs = enumerator.list().await.expect("ps should run");
        let me = std::process::id();
        assert!(procs.iter().any(|p| p.pid == me));
    }

    #[tokio::test]
    async fn self_is_alive_and_absent_pid_is_not() {
        let enumerator = PosixProcessEnum::new();
        assert!(enumerator.is_alive(std::process::id()).await);
        // Far above any realistic pid_max, but still a valid pid_t.
        assert!(!enumerator.is_alive(999_999_999).await);
    }
}
