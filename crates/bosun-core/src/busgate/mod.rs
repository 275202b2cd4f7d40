//! Per-SDK session gate.
//!
//! Each SDK adapter supports at most one active interactive session. A
//! caller that finds the slot taken is routed to the pooled execution
//! path instead of blocking. Transient failures put the adapter into an
//! exponentially growing cooldown; the orchestrator's own
//! `monitor-monitor` health check bypasses the cooldown so a stuck
//! adapter can never block its own diagnosis.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Task key that bypasses SDK cooldowns (after trimming whitespace).
pub const MONITOR_MONITOR_KEY: &str = "monitor-monitor";

/// Base of the transient-failure backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Upper bound on any single cooldown.
const BACKOFF_CAP: Duration = Duration::from_secs(15 * 60);

/// Options for [`AdapterBusGate::enter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnterOptions {
    /// Explicit cooldown override. `Some(true)` always bypasses;
    /// `Some(false)` disables the monitor-monitor bypass too.
    pub ignore_sdk_cooldown: Option<bool>,
}

/// Result of trying to enter an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The caller now holds the adapter's session slot.
    Entered,
    /// The slot is held by another session; run on the pool instead.
    Pooled,
    /// The adapter is cooling down and no bypass applies.
    Rejected { reason: String },
}

/// Outcome reported when leaving an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    /// Rate limits, overload -- feeds the cooldown backoff.
    TransientFailure,
    /// Permanent errors do not cool the adapter down; the router's
    /// failure accounting handles them.
    FatalFailure,
    Cancelled,
}

#[derive(Debug, Default)]
struct AdapterState {
    active_session: Option<String>,
    cooldown_until: Option<Instant>,
    transient_failures: u32,
}

/// Concurrency gate over all SDK adapters.
#[derive(Debug, Default)]
pub struct AdapterBusGate {
    adapters: Mutex<HashMap<String, AdapterState>>,
}

impl AdapterBusGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the session slot of adapter `sdk`.
    pub fn enter(
        &self,
        sdk: &str,
        session_id: &str,
        task_key: &str,
        opts: EnterOptions,
    ) -> GateDecision {
        self.enter_at(sdk, session_id, task_key, opts, Instant::now())
    }

    fn enter_at(
        &self,
        sdk: &str,
        session_id: &str,
        task_key: &str,
        opts: EnterOptions,
        now: Instant,
    ) -> GateDecision {
        let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        let state = adapters.entry(sdk.to_string()).or_default();

        let bypass = match opts.ignore_sdk_cooldown {
            Some(true) => true,
            Some(false) => false,
            None => task_key.trim() == MONITOR_MONITOR_KEY,
        };

        if let Some(until) = state.cooldown_until {
            if until > now && !bypass {
                return GateDecision::Rejected {
                    reason: format!("Cooling down: {sdk}"),
                };
            }
        }

        match &state.active_session {
            Some(active) if active != session_id => GateDecision::Pooled,
            _ => {
                state.active_session = Some(session_id.to_string());
                GateDecision::Entered
            }
        }
    }

    /// Leave an adapter, reporting how the session ended.
    pub fn exit(&self, sdk: &str, session_id: &str, outcome: SessionOutcome) {
        self.exit_at(sdk, session_id, outcome, Instant::now());
    }

    fn exit_at(&self, sdk: &str, session_id: &str, outcome: SessionOutcome, now: Instant) {
        let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        let state = adapters.entry(sdk.to_string()).or_default();

        if state.active_session.as_deref() == Some(session_id) {
            state.active_session = None;
        }

        match outcome {
            SessionOutcome::Success => {
                state.transient_failures = 0;
                state.cooldown_until = None;
            }
            SessionOutcome::TransientFailure => {
                state.transient_failures += 1;
                let cooldown = backoff(state.transient_failures);
                state.cooldown_until = Some(now + cooldown);
                tracing::warn!(
                    sdk,
                    failures = state.transient_failures,
                    cooldown_secs = cooldown.as_secs(),
                    "adapter cooling down after transient failure"
                );
            }
            SessionOutcome::FatalFailure | SessionOutcome::Cancelled => {}
        }
    }

    /// Whether the adapter is currently inside a cooldown window.
    pub fn is_cooling_down(&self, sdk: &str) -> bool {
        let adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        adapters
            .get(sdk)
            .and_then(|s| s.cooldown_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }
}

/// Exponential backoff with a cap: 30s, 60s, 120s, ... up to 15 min.
fn backoff(consecutive_transient: u32) -> Duration {
    let exp = consecutive_transient.saturating_sub(1).min(10);
    let cooldown = BACKOFF_BASE.saturating_mul(1u32 << exp);
    cooldown.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_claims_free_slot() {
        let gate = AdapterBusGate::new();
        assert_eq!(
            gate.enter("codex", "s1", "task-1", EnterOptions::default()),
            GateDecision::Entered
        );
    }

    #[test]
    fn reentry_with_same_session_is_allowed() {
        let gate = AdapterBusGate::new();
        gate.enter("codex", "s1", "task-1", EnterOptions::default());
        assert_eq!(
            gate.enter("codex", "s1", "task-1", EnterOptions::default()),
            GateDecision::Entered
        );
    }

    #[test]
    fn second_session_is_pooled() {
        let gate = AdapterBusGate::new();
        gate.enter("codex", "s1", "task-1", EnterOptions::default());
        assert_eq!(
            gate.enter("codex", "s2", "task-2", EnterOptions::default()),
            GateDecision::Pooled
        );
    }

    #[test]
    fn adapters_are_independent() {
        let gate = AdapterBusGate::new();
        gate.enter("codex", "s1", "task-1", EnterOptions::default());
        assert_eq!(
            gate.enter("claude", "s2", "task-2", EnterOptions::default()),
            GateDecision::Entered
        );
    }

    #[test]
    fn exit_frees_only_matching_session() {
        let gate = AdapterBusGate::new();
        gate.enter("codex", "s1", "task-1", EnterOptions::default());
        gate.exit("codex", "other", SessionOutcome::Success);
        assert_eq!(
            gate.enter("codex", "s2", "task-2", EnterOptions::default()),
            GateDecision::Pooled
        );

        gate.exit("codex", "s1", SessionOutcome::Success);
        assert_eq!(
            gate.enter("codex", "s2", "task-2", EnterOptions::default()),
            GateDecision::Entered
        );
    }

    #[test]
    fn transient_failure_starts_cooldown() {
        let gate = AdapterBusGate::new();
        let now = Instant::now();
        gate.enter_at("codex", "s1", "task-1", EnterOptions::default(), now);
        gate.exit_at("codex", "s1", SessionOutcome::TransientFailure, now);

        assert_eq!(
            gate.enter_at("codex", "s2", "task-2", EnterOptions::default(), now),
            GateDecision::Rejected {
                reason: "Cooling down: codex".into()
            }
        );

        // After the window the adapter opens up again.
        let later = now + Duration::from_secs(31);
        assert_eq!(
            gate.enter_at("codex", "s2", "task-2", EnterOptions::default(), later),
            GateDecision::Entered
        );
    }

    #[test]
    fn monitor_monitor_bypasses_cooldown() {
        let gate = AdapterBusGate::new();
        let now = Instant::now();
        gate.enter_at("codex", "s1", "task-x", EnterOptions::default(), now);
        gate.exit_at("codex", "s1", SessionOutcome::TransientFailure, now);

        // Ordinary task: rejected.
        assert_eq!(
            gate.enter_at("codex", "s2", "task-x", EnterOptions::default(), now),
            GateDecision::Rejected {
                reason: "Cooling down: codex".into()
            }
        );
        // Health check: allowed, including with whitespace padding.
        assert_eq!(
            gate.enter_at("codex", "s3", "  monitor-monitor  ", EnterOptions::default(), now),
            GateDecision::Entered
        );
    }

    #[test]
    fn explicit_false_disables_the_bypass() {
        let gate = AdapterBusGate::new();
        let now = Instant::now();
        gate.enter_at("codex", "s1", "t", EnterOptions::default(), now);
        gate.exit_at("codex", "s1", SessionOutcome::TransientFailure, now);

        let opts = EnterOptions {
            ignore_sdk_cooldown: Some(false),
        };
        assert_eq!(
            gate.enter_at("codex", "s2", "monitor-monitor", opts, now),
            GateDecision::Rejected {
                reason: "Cooling down: codex".into()
            }
        );
    }

    #[test]
    fn explicit_true_bypasses_for_any_task() {
        let gate = AdapterBusGate::new();
        let now = Instant::now();
        gate.enter_at("codex", "s1", "t", EnterOptions::default(), now);
        gate.exit_at("codex", "s1", SessionOutcome::TransientFailure, now);

        let opts = EnterOptions {
            ignore_sdk_cooldown: Some(true),
        };
        assert_eq!(
            gate.enter_at("codex", "s2", "ordinary-task", opts, now),
            GateDecision::Entered
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(30));
        assert_eq!(backoff(2), Duration::from_secs(60));
        assert_eq!(backoff(3), Duration::from_secs(120));
        assert_eq!(backoff(20), BACKOFF_CAP);
    }

    #[test]
    fn success_resets_backoff() {
        let gate = AdapterBusGate::new();
        let now = Instant::now();
        for _ in 0..3 {
            gate.enter_at(
                "codex",
                "s1",
                "t",
                EnterOptions {
                    ignore_sdk_cooldown: Some(true),
                },
                now,
            );
            gate.exit_at("codex", "s1", SessionOutcome::TransientFailure, now);
        }
        gate.enter_at(
            "codex",
            "s1",
            "t",
            EnterOptions {
                ignore_sdk_cooldown: Some(true),
            },
            now,
        );
        gate.exit_at("codex", "s1", SessionOutcome::Success, now);
        assert!(!gate.is_cooling_down("codex"));

        // Next transient failure starts from the base again.
        gate.enter_at("codex", "s1", "t", EnterOptions::default(), now);
        gate.exit_at("codex", "s1", SessionOutcome::TransientFailure, now);
        let just_past_base = now + Duration::from_secs(31);
        assert_eq!(
            gate.enter_at("codex", "s2", "t", EnterOptions::default(), just_past_base),
            GateDecision::Entered
        );
    }
}
