//! Executor selection: distribution, failover, and retry policy.
//!
//! The router turns a task and the registry into an ordered candidate
//! list. The head of the list comes from the distribution mode; the tail
//! is the failover order over the remaining available profiles. The
//! supervisor walks the list up to `max_retries`.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::executor::{ExecutorProfile, ExecutorRegistry};

/// Conventional-commit title pattern; capture 2 is the scope.
static CONVENTIONAL_COMMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(feat|fix|docs|style|refactor|perf|test|build|ci|chore|revert)\(([^)]+)\)")
        .expect("conventional commit regex is valid")
});

/// Extract the scope from a conventional-commit task title.
pub fn parse_scope(title: &str) -> Option<&str> {
    CONVENTIONAL_COMMIT
        .captures(title)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

/// How new tasks are spread over executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionMode {
    /// Probabilistic by weight over enabled profiles.
    Weighted,
    /// Rotate over enabled profiles with a persistent cursor.
    RoundRobin,
    /// Always the primary; others are failover-only.
    #[default]
    PrimaryOnly,
}

/// How the rest of the candidate list is ordered after the first pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverStrategy {
    /// Sort remaining profiles by role priority.
    #[default]
    NextInLine,
    /// Sample remaining profiles by weight.
    WeightedRandom,
    /// Continue from the round-robin cursor.
    RoundRobin,
}

/// Retry and cooldown policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterPolicy {
    pub max_retries: u32,
    pub cooldown_minutes: u64,
    pub disable_on_consecutive_failures: u32,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown_minutes: 5,
            disable_on_consecutive_failures: 3,
        }
    }
}

impl RouterPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}

/// Executor selection engine. The round-robin cursor lives for the
/// process lifetime; distributed instances each keep their own.
#[derive(Debug)]
pub struct Router {
    pub distribution: DistributionMode,
    pub failover: FailoverStrategy,
    pub policy: RouterPolicy,
    cursor: usize,
}

impl Router {
    pub fn new(
        distribution: DistributionMode,
        failover: FailoverStrategy,
        policy: RouterPolicy,
    ) -> Self {
        Self {
            distribution,
            failover,
            policy,
            cursor: 0,
        }
    }

    /// Build the ordered candidate list for a task.
    ///
    /// Only enabled profiles outside their cooldown window participate.
    /// A profile whose declared scopes contain the task's
    /// conventional-commit scope is promoted to the front of its
    /// segment.
    pub fn pick(&mut self, registry: &ExecutorRegistry, task_title: &str) -> Vec<String> {
        self.pick_at(registry, task_title, Instant::now(), &mut rand::rng())
    }

    fn pick_at<R: Rng>(
        &mut self,
        registry: &ExecutorRegistry,
        task_title: &str,
        now: Instant,
        rng: &mut R,
    ) -> Vec<String> {
        let available = registry.available_profiles(now);
        if available.is_empty() {
            return Vec::new();
        }

        let first_index = match self.distribution {
            DistributionMode::PrimaryOnly => available
                .iter()
                .position(|p| p.role == "primary")
                .unwrap_or(0),
            DistributionMode::Weighted => pick_weighted_index(&available, rng),
            DistributionMode::RoundRobin => {
                let index = self.cursor % available.len();
                self.cursor = self.cursor.wrapping_add(1);
                index
            }
        };

        let first = available[first_index];
        let mut rest: Vec<&ExecutorProfile> = available
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != first_index)
            .map(|(_, p)| *p)
            .collect();

        match self.failover {
            FailoverStrategy::NextInLine => {
                rest.sort_by_key(|p| p.role_priority());
            }
            FailoverStrategy::WeightedRandom => {
                rest = sample_without_replacement(rest, rng);
            }
            FailoverStrategy::RoundRobin => {
                if !rest.is_empty() {
                    let offset = self.cursor % rest.len();
                    rest.rotate_left(offset);
                }
            }
        }

        let mut candidates: Vec<&ExecutorProfile> = Vec::with_capacity(1 + rest.len());
        candidates.push(first);
        candidates.extend(rest);

        // Scope affinity: stable-partition matching profiles forward.
        if let Some(scope) = parse_scope(task_title) {
            let (matching, other): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|p| p.scopes.iter().any(|s| s == scope));
            candidates = matching;
            candidates.extend(other);
        }

        candidates.into_iter().map(|p| p.name.clone()).collect()
    }
}

/// Pick an index into `profiles` with probability proportional to weight.
fn pick_weighted_index<R: Rng>(profiles: &[&ExecutorProfile], rng: &mut R) -> usize {
    let total: u64 = profiles.iter().map(|p| u64::from(p.weight)).sum();
    let mut roll = rng.random_range(0..total);
    for (i, profile) in profiles.iter().enumerate() {
        let w = u64::from(profile.weight);
        if roll < w {
            return i;
        }
        roll -= w;
    }
    profiles.len() - 1
}

/// Weighted sampling without replacement: repeatedly draw by weight from
/// what remains.
fn sample_without_replacement<'p, R: Rng>(
    mut pool: Vec<&'p ExecutorProfile>,
    rng: &mut R,
) -> Vec<&'p ExecutorProfile> {
    let mut out = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let index = pick_weighted_index(&pool, rng);
        out.push(pool.remove(index));
    }
    out
}
