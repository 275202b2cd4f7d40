//! Executor profiles and their registry.
//!
//! Configuration arrives as a loose list of profile entries; the registry
//! normalizes it into a shape the router can rely on: every weight is at
//! least one, every profile has a role, and exactly one profile is
//! primary.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// The agent runtimes bosun can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Codex,
    Copilot,
    Claude,
    Gemini,
    Opencode,
}

impl ExecutorKind {
    /// The SDK adapter slug used by the bus gate.
    pub fn sdk_slug(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Copilot => "copilot",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Opencode => "opencode",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sdk_slug())
    }
}

impl FromStr for ExecutorKind {
    type Err = ExecutorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "codex" => Ok(Self::Codex),
            "copilot" => Ok(Self::Copilot),
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "opencode" => Ok(Self::Opencode),
            other => Err(ExecutorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutorKind`] string.
#[derive(Debug, Clone)]
pub struct ExecutorKindParseError(pub String);

impl fmt::Display for ExecutorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid executor kind: {:?}", self.0)
    }
}

impl std::error::Error for ExecutorKindParseError {}

/// A raw profile entry as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    pub executor: ExecutorKind,
    /// Model token passed through to the SDK, e.g. "gpt-5-codex".
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Conventional-commit scopes this profile prefers, e.g. ["api"].
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A normalized executor profile.
#[derive(Debug, Clone)]
pub struct ExecutorProfile {
    pub name: String,
    pub executor: ExecutorKind,
    pub variant: Option<String>,
    /// Always >= 1 after normalization.
    pub weight: u32,
    pub role: String,
    pub enabled: bool,
    pub scopes: Vec<String>,
    pub consecutive_failures: u32,
    /// Monotonic deadline before which the profile is skipped.
    pub disabled_until: Option<Instant>,
}

impl ExecutorProfile {
    /// Whether the router may hand work to this profile right now.
    pub fn is_available(&self, now: Instant) -> bool {
        self.enabled
            && self
                .disabled_until
                .map(|until| until <= now)
                .unwrap_or(true)
    }

    /// Ordering weight of the role for next-in-line failover.
    pub fn role_priority(&self) -> u32 {
        match self.role.as_str() {
            "primary" => 0,
            "backup" => 1,
            "tertiary" => 2,
            role => role
                .strip_prefix("executor-")
                .and_then(|n| n.parse::<u32>().ok())
                .map(|n| 3 + n)
                .unwrap_or(u32::MAX),
        }
    }
}

/// Snapshot of one profile's health, exposed to external observers.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub name: String,
    pub executor: ExecutorKind,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
}

/// Normalized collection of executor profiles.
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    profiles: Vec<ExecutorProfile>,
    by_name: HashMap<String, usize>,
    by_role: HashMap<String, usize>,
}

/// Role assigned by position when the config does not name one.
fn default_role_for_index(index: usize) -> String {
    match index {
        0 => "primary".to_string(),
        1 => "backup".to_string(),
        2 => "tertiary".to_string(),
        n => format!("executor-{n}"),
    }
}

impl ExecutorRegistry {
    /// Normalize a config list into a registry.
    ///
    /// - weights default to 1 and non-positive values are coerced to 1;
    /// - roles default by index (primary, backup, tertiary, executor-N);
    /// - exactly one primary survives: the first declared (or defaulted)
    ///   wins, later claims are demoted to their index default; when no
    ///   profile claims primary at all, the first one is promoted.
    pub fn normalize(configs: Vec<ProfileConfig>) -> Self {
        let mut profiles: Vec<ExecutorProfile> = Vec::with_capacity(configs.len());
        let mut primary_seen = false;

        for (index, config) in configs.into_iter().enumerate() {
            let weight = match config.weight {
                Some(w) if w >= 1 => w as u32,
                _ => 1,
            };

            let mut role = config
                .role
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| default_role_for_index(index));

            if role == "primary" {
                if primary_seen {
                    role = default_role_for_index(index);
                    // index 0 is the only index defaulting to primary,
                    // and it is also necessarily the first claim.
                    debug_assert_ne!(role, "primary");
                } else {
                    primary_seen = true;
                }
            }

            profiles.push(ExecutorProfile {
                name: config.name,
                executor: config.executor,
                variant: config.variant,
                weight,
                role,
                enabled: config.enabled.unwrap_or(true),
                scopes: config.scopes,
                consecutive_failures: 0,
                disabled_until: None,
            });
        }

        if !primary_seen {
            if let Some(first) = profiles.first_mut() {
                first.role = "primary".to_string();
            }
        }

        let mut by_name = HashMap::new();
        let mut by_role = HashMap::new();
        for (i, profile) in profiles.iter().enumerate() {
            by_name.entry(profile.name.clone()).or_insert(i);
            by_role.entry(profile.role.clone()).or_insert(i);
        }

        Self {
            profiles,
            by_name,
            by_role,
        }
    }

    pub fn profiles(&self) -> &[ExecutorProfile] {
        &self.profiles
    }

    pub fn by_name(&self, name: &str) -> Option<&ExecutorProfile> {
        self.by_name.get(name).map(|&i| &self.profiles[i])
    }

    pub fn by_role(&self, role: &str) -> Option<&ExecutorProfile> {
        self.by_role.get(role).map(|&i| &self.profiles[i])
    }

    pub fn primary(&self) -> Option<&ExecutorProfile> {
        self.by_role("primary")
    }

    /// Profiles the router may currently hand work to.
    pub fn available_profiles(&self, now: Instant) -> Vec<&ExecutorProfile> {
        self.profiles
            .iter()
            .filter(|p| p.is_available(now))
            .collect()
    }

    /// Record a failed attempt on a profile. When the consecutive-failure
    /// count reaches `disable_threshold`, the profile is disabled until
    /// `now + cooldown`. Returns `true` when the profile was disabled by
    /// this call.
    pub fn record_failure(
        &mut self,
        name: &str,
        disable_threshold: u32,
        cooldown: Duration,
        now: Instant,
    ) -> bool {
        let Some(&index) = self.by_name.get(name) else {
            return false;
        };
        let profile = &mut self.profiles[index];
        profile.consecutive_failures += 1;
        if profile.consecutive_failures >= disable_threshold {
            profile.disabled_until = Some(now + cooldown);
            tracing::warn!(
                profile = %profile.name,
                failures = profile.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "executor disabled after consecutive failures"
            );
            return true;
        }
        false
    }

    /// Record a successful attempt: resets the failure counter and clears
    /// any cooldown.
    pub fn record_success(&mut self, name: &str) {
        if let Some(&index) = self.by_name.get(name) {
            let profile = &mut self.profiles[index];
            profile.consecutive_failures = 0;
            profile.disabled_until = None;
        }
    }

    /// Health snapshots for external observers.
    pub fn status_snapshot(&self, now: Instant) -> Vec<ExecutorStatus> {
        self.profiles
            .iter()
            .map(|p| ExecutorStatus {
                name: p.name.clone(),
                executor: p.executor,
                enabled: p.enabled,
                consecutive_failures: p.consecutive_failures,
                cooling_down: p.disabled_until.map(|u| u > now).unwrap_or(false),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, executor: ExecutorKind) -> ProfileConfig {
        ProfileConfig {
            name: name.to_string(),
            executor,
            variant: None,
            weight: None,
            role: None,
            enabled: None,
            scopes: Vec::new(),
        }
    }

    #[test]
    fn roles_default_by_index() {
        let registry = ExecutorRegistry::normalize(vec![
            config("a", ExecutorKind::Codex),
            config("b", ExecutorKind::Claude),
            config("c", ExecutorKind::Gemini),
            config("d", ExecutorKind::Copilot),
        ]);

        let roles: Vec<&str> = registry.profiles().iter().map(|p| p.role.as_str()).collect();
        assert_eq!(roles, vec!["primary", "backup", "tertiary", "executor-3"]);
    }

    #[test]
    fn weight_defaults_and_coercion() {
        let mut cfg = config("a", ExecutorKind::Codex);
        cfg.weight = Some(-5);
        let mut cfg2 = config("b", ExecutorKind::Claude);
        cfg2.weight = Some(0);
        let mut cfg3 = config("c", ExecutorKind::Gemini);
        cfg3.weight = Some(7);

        let registry = ExecutorRegistry::normalize(vec![cfg, cfg2, cfg3]);
        let weights: Vec<u32> = registry.profiles().iter().map(|p| p.weight).collect();
        assert_eq!(weights, vec![1, 1, 7]);
    }

    #[test]
    fn first_primary_wins() {
        let mut a = config("a", ExecutorKind::Codex);
        a.role = Some("backup".into());
        let mut b = config("b", ExecutorKind::Claude);
        b.role = Some("primary".into());
        let mut c = config("c", ExecutorKind::Gemini);
        c.role = Some("primary".into());

        let registry = ExecutorRegistry::normalize(vec![a, b, c]);
        let primaries: Vec<&str> = registry
            .profiles()
            .iter()
            .filter(|p| p.role == "primary")
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(primaries, vec!["b"]);
        assert_eq!(registry.primary().unwrap().name, "b");
    }

    #[test]
    fn primary_is_promoted_when_absent() {
        let mut a = config("a", ExecutorKind::Codex);
        a.role = Some("backup".into());
        let mut b = config("b", ExecutorKind::Claude);
        b.role = Some("tertiary".into());

        let registry = ExecutorRegistry::normalize(vec![a, b]);
        assert_eq!(registry.primary().unwrap().name, "a");
    }

    #[test]
    fn lookup_indexes() {
        let registry = ExecutorRegistry::normalize(vec![
            config("alpha", ExecutorKind::Codex),
            config("beta", ExecutorKind::Claude),
        ]);
        assert_eq!(registry.by_name("beta").unwrap().role, "backup");
        assert_eq!(registry.by_role("backup").unwrap().name, "beta");
        assert!(registry.by_name("gamma").is_none());
    }

    #[test]
    fn failure_bookkeeping_disables_and_success_resets() {
        let mut registry = ExecutorRegistry::normalize(vec![config("a", ExecutorKind::Codex)]);
        let now = Instant::now();
        let cooldown = Duration::from_secs(300);

        assert!(!registry.record_failure("a", 3, cooldown, now));
        assert!(!registry.record_failure("a", 3, cooldown, now));
        assert!(registry.record_failure("a", 3, cooldown, now));

        let profile = registry.by_name("a").unwrap();
        assert!(!profile.is_available(now));
        // Available again once the cooldown elapses.
        assert!(profile.is_available(now + cooldown));

        registry.record_success("a");
        let profile = registry.by_name("a").unwrap();
        assert_eq!(profile.consecutive_failures, 0);
        assert!(profile.is_available(now));
    }

    #[test]
    fn role_priority_ordering() {
        let registry = ExecutorRegistry::normalize(vec![
            config("a", ExecutorKind::Codex),
            config("b", ExecutorKind::Claude),
            config("c", ExecutorKind::Gemini),
            config("d", ExecutorKind::Copilot),
        ]);
        let mut priorities: Vec<u32> = registry
            .profiles()
            .iter()
            .map(|p| p.role_priority())
            .collect();
        let sorted = {
            let mut s = priorities.clone();
            s.sort();
            s
        };
        priorities.sort();
        assert_eq!(priorities, sorted);
        assert_eq!(registry.profiles()[0].role_priority(), 0);
    }
}
