//! Keyed log throttling.
//!
//! Long-running sweeps emit the same warning for the same branch every
//! cycle. The throttle keeps one record per key and suppresses repeats
//! inside a window, carrying a suppressed count onto the next log that
//! does get through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum throttle window; smaller configured values are clamped up.
pub const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Floor applied to windows configured through environment variables.
const ENV_FLOOR_MS: u64 = 5000;

/// Default window for branch-sync logs: 5 minutes.
pub const BRANCH_SYNC_DEFAULT: Duration = Duration::from_secs(300);

/// Default window for duplicate-start warnings: 60 seconds.
pub const DUPLICATE_START_DEFAULT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct ThrottleEntry {
    last_logged_at: Instant,
    suppressed: u64,
}

/// Per-key log suppression with a fixed window.
///
/// Keys are slugs like `sync:{branch}:{event}`, not arbitrary strings.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    entries: Mutex<HashMap<String, ThrottleEntry>>,
}

impl LogThrottle {
    /// Create a throttle with the given window, clamped to [`MIN_WINDOW`].
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a throttle whose window comes from an environment variable
    /// holding milliseconds, falling back to `default` when unset or
    /// unparseable. Configured values below 5000 ms are raised to 5000 ms.
    pub fn from_env(var: &str, default: Duration) -> Self {
        let window = std::env::var(var)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|ms| Duration::from_millis(ms.max(ENV_FLOOR_MS)))
            .unwrap_or(default);
        Self::new(window)
    }

    /// The effective window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether a log for `key` may be emitted now.
    ///
    /// Returns `Some(suppressed)` when the caller should log, where
    /// `suppressed` is the number of emissions swallowed since the last
    /// one that got through. Returns `None` when the caller must stay
    /// quiet.
    pub fn should_log(&self, key: &str) -> Option<u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Option<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    ThrottleEntry {
                        last_logged_at: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
            Some(entry) => {
                if now.duration_since(entry.last_logged_at) >= self.window {
                    let suppressed = entry.suppressed;
                    entry.last_logged_at = now;
                    entry.suppressed = 0;
                    Some(suppressed)
                } else {
                    entry.suppressed += 1;
                    None
                }
            }
        }
    }

    /// Drop all throttle state (used between test cases and on reload).
    pub fn reset(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emission_passes() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.should_log("sync:main:diverged"), Some(0));
    }

    #[test]
    fn repeats_inside_window_are_suppressed() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.should_log("k"), Some(0));
        assert_eq!(throttle.should_log("k"), None);
        assert_eq!(throttle.should_log("k"), None);
    }

    #[test]
    fn suppressed_count_carries_to_next_emission() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(throttle.check_at("k", start), Some(0));
        assert_eq!(throttle.check_at("k", start), None);
        assert_eq!(throttle.check_at("k", start), None);

        let later = start + Duration::from_secs(61);
        assert_eq!(throttle.check_at("k", later), Some(2));
        // Counter resets after the carry-over.
        let much_later = later + Duration::from_secs(61);
        assert_eq!(throttle.check_at("k", much_later), Some(0));
    }

    #[test]
    fn keys_are_independent() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.should_log("a"), Some(0));
        assert_eq!(throttle.should_log("b"), Some(0));
        assert_eq!(throttle.should_log("a"), None);
    }

    #[test]
    fn window_clamped_to_minimum() {
        let throttle = LogThrottle::new(Duration::from_millis(10));
        assert_eq!(throttle.window(), MIN_WINDOW);
    }

    #[test]
    fn env_values_below_floor_are_raised() {
        // Not using real env vars here; exercise the clamp directly.
        let window = Duration::from_millis(100u64.max(ENV_FLOOR_MS));
        assert_eq!(window, Duration::from_millis(5000));
    }
}
