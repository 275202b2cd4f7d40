//! Command-line classification for lock-owner processes.
//!
//! Given only a PID and a command line we must decide whether the other
//! process is a bosun monitor (real contention), something else entirely
//! (PID reuse), or unknowable. The rules are deliberately conservative:
//! misclassifying a live monitor as reuse would let two orchestrators
//! run against the same config directory.

use chrono::{DateTime, Duration, Utc};

/// Markers whose presence in a normalized command line always means
/// "this is a monitor". `openfleet` is the legacy brand alias.
const MONITOR_MARKERS: &[&str] = &["bosun/monitor.mjs", "openfleet/monitor.mjs"];

/// JS launchers that, combined with a monitor script segment, classify
/// as monitor even without the full path marker.
const JS_LAUNCHERS: &[&str] = &["node", "bun", "tsx", "deno"];

/// Script segment that identifies a monitor invocation, including the
/// eval form `node -e 'import("./monitor.mjs")'`.
const MONITOR_SCRIPT: &str = "monitor.mjs";

/// How recently a process must have started for an unclassifiable owner
/// to still be presumed a live monitor.
const UNKNOWN_OWNER_GRACE: Duration = Duration::minutes(3);

/// Classification of a process command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdlineClass {
    /// Definitely a bosun monitor process.
    Monitor,
    /// Definitely something else.
    Other,
    /// Command line unavailable.
    Unknown,
}

/// Classify a raw command line.
///
/// Deterministic and total: every input maps to exactly one class.
pub fn classify(command_line: &str) -> CmdlineClass {
    let normalized = normalize(command_line);
    if normalized.is_empty() {
        return CmdlineClass::Unknown;
    }

    if MONITOR_MARKERS.iter().any(|m| normalized.contains(m)) {
        return CmdlineClass::Monitor;
    }

    if has_js_launcher(&normalized) && normalized.contains(MONITOR_SCRIPT) {
        return CmdlineClass::Monitor;
    }

    CmdlineClass::Other
}

/// Decide whether a lock owner with an *unknown* command line should be
/// presumed to be a live monitor.
///
/// True iff the recorded argv looks like a monitor invocation AND the
/// recorded start time is either unparseable or within three minutes of
/// `now`. A monitor that has been up longer would be enumerable, so an
/// old start time plus an invisible command line points at PID reuse.
pub fn should_assume_monitor_for_unknown_owner(
    argv: &[String],
    started_at: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    let joined = argv.join(" ");
    if classify(&joined) != CmdlineClass::Monitor {
        return false;
    }

    let Some(raw) = started_at else {
        return true;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Err(_) => true,
        Ok(started) => {
            let age = now.signed_duration_since(started.with_timezone(&Utc));
            age <= UNKNOWN_OWNER_GRACE && age >= -UNKNOWN_OWNER_GRACE
        }
    }
}

/// Lowercase and normalize path separators so Windows command lines
/// match the same markers.
fn normalize(command_line: &str) -> String {
    command_line.trim().to_ascii_lowercase().replace('\\', "/")
}

/// Check whether any token's basename is a known JS launcher
/// (`node`, `node.exe`, `/usr/bin/node`, ...).
fn has_js_launcher(normalized: &str) -> bool {
    normalized.split_whitespace().any(|token| {
        let base = token.rsplit('/').next().unwrap_or(token);
        let base = base.strip_suffix(".exe").unwrap_or(base);
        JS_LAUNCHERS.contains(&base)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_path_is_monitor() {
        assert_eq!(
            classify("node /opt/bosun/monitor.mjs --managed"),
            CmdlineClass::Monitor
        );
        assert_eq!(
            classify(r"C:\tools\node.exe C:\bosun\monitor.mjs"),
            CmdlineClass::Monitor
        );
    }

    #[test]
    fn launcher_plus_script_is_monitor() {
        assert_eq!(classify("bun run monitor.mjs"), CmdlineClass::Monitor);
        assert_eq!(classify("tsx ./monitor.mjs"), CmdlineClass::Monitor);
        assert_eq!(
            classify(r#"node -e 'import("./monitor.mjs")'"#),
            CmdlineClass::Monitor
        );
    }

    #[test]
    fn legacy_brand_alias_is_monitor() {
        assert_eq!(
            classify("node /srv/openfleet/monitor.mjs"),
            CmdlineClass::Monitor
        );
    }

    #[test]
    fn script_without_launcher_is_other() {
        // A path mentioning monitor.mjs without a JS launcher or the
        // full marker is not enough.
        assert_eq!(classify("cat monitor.mjs"), CmdlineClass::Other);
    }

    #[test]
    fn launcher_without_script_is_other() {
        assert_eq!(classify("node server.js"), CmdlineClass::Other);
        assert_eq!(classify("git push origin main"), CmdlineClass::Other);
    }

    #[test]
    fn empty_is_unknown() {
        assert_eq!(classify(""), CmdlineClass::Unknown);
        assert_eq!(classify("   "), CmdlineClass::Unknown);
    }

    #[test]
    fn nodejs_substring_does_not_count_as_launcher() {
        // "nodejs-tool" must not match the "node" launcher token.
        assert_eq!(classify("nodejs-tool monitor.mjs"), CmdlineClass::Other);
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_owner_recent_monitor_argv() {
        let now = Utc::now();
        let recent = (now - Duration::seconds(30)).to_rfc3339();
        assert!(should_assume_monitor_for_unknown_owner(
            &argv(&["node", "monitor.mjs"]),
            Some(&recent),
            now,
        ));
    }

    #[test]
    fn unknown_owner_old_monitor_argv_is_reuse() {
        let now = Utc::now();
        let old = (now - Duration::minutes(10)).to_rfc3339();
        assert!(!should_assume_monitor_for_unknown_owner(
            &argv(&["node", "monitor.mjs"]),
            Some(&old),
            now,
        ));
    }

    #[test]
    fn unknown_owner_unparseable_start_is_monitor() {
        assert!(should_assume_monitor_for_unknown_owner(
            &argv(&["node", "monitor.mjs"]),
            Some("not-a-date"),
            Utc::now(),
        ));
        assert!(should_assume_monitor_for_unknown_owner(
            &argv(&["node", "monitor.mjs"]),
            None,
            Utc::now(),
        ));
    }

    #[test]
    fn unknown_owner_non_monitor_argv_is_never_assumed() {
        let now = Utc::now();
        let recent = (now - Duration::seconds(5)).to_rfc3339();
        assert!(!should_assume_monitor_for_unknown_owner(
            &argv(&["python", "train.py"]),
            Some(&recent),
            now,
        ));
    }
}
