//! The control loop.
//!
//! One logical dispatch at a time: pull ready tasks, pick executor
//! candidates, run each attempt through gate -> worktree -> SDK ->
//! push -> status update. Maintenance sweeps run on their own timer but
//! serialize with dispatch through a global mutex. Parallelism comes
//! from running more orchestrator instances (each with its own config
//! directory) and from the bus gate's pooled path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bosun_db::models::{AttemptOutcome, FailureKind, Task, TaskStatus};
use bosun_db::queries::attempts;

use crate::busgate::{AdapterBusGate, EnterOptions, GateDecision, SessionOutcome};
use crate::executor::ExecutorRegistry;
use crate::git::GitRepo;
use crate::kanban::KanbanSync;
use crate::lock::{Acquisition, LockManager};
use crate::maintenance::MaintenanceSweeper;
use crate::router::Router;
use crate::sdk::{AgentSdkClient, Notifier, SdkCompletion, SdkPool, SdkRequest};
use crate::taskstore::TaskStore;
use crate::worktree::WorktreeManager;

/// Interval between attempt heartbeats while the SDK call is in flight.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Base branch attempts fork from.
    pub base_branch: String,
    /// Delay between dispatch cycles.
    pub cycle_interval: Duration,
    /// Delay between maintenance sweeps.
    pub sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            cycle_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Errors that stop the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Another instance owns the config directory. The only fatal class.
    #[error("another bosun is already running (PID {pid})")]
    LockContention { pid: u32 },

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Outcome of dispatching one task through its candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// Every candidate failed or was unavailable.
    Exhausted,
    /// No executor candidates were available at all.
    NoCandidates,
}

/// Everything the control loop drives.
pub struct Supervisor {
    config: SupervisorConfig,
    lock: Arc<LockManager>,
    store: Arc<TaskStore>,
    registry: Mutex<ExecutorRegistry>,
    router: Mutex<Router>,
    gate: AdapterBusGate,
    clients: HashMap<String, Arc<dyn AgentSdkClient>>,
    pool: Arc<dyn SdkPool>,
    notifier: Arc<dyn Notifier>,
    worktrees: WorktreeManager,
    repo: GitRepo,
    kanban: Option<KanbanSync>,
    sweeper: MaintenanceSweeper,
    /// Serializes dispatch cycles with maintenance sweeps.
    dispatch_mutex: Mutex<()>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        lock: Arc<LockManager>,
        store: Arc<TaskStore>,
        registry: ExecutorRegistry,
        router: Router,
        clients: HashMap<String, Arc<dyn AgentSdkClient>>,
        pool: Arc<dyn SdkPool>,
        notifier: Arc<dyn Notifier>,
        worktrees: WorktreeManager,
        kanban: Option<KanbanSync>,
        sweeper: MaintenanceSweeper,
    ) -> Self {
        let repo = worktrees.repo().clone();
        Self {
            config,
            lock,
            store,
            registry: Mutex::new(registry),
            router: Mutex::new(router),
            gate: AdapterBusGate::new(),
            clients,
            pool,
            notifier,
            worktrees,
            repo,
            kanban,
            sweeper,
            dispatch_mutex: Mutex::new(()),
        }
    }

    /// Current executor health snapshots.
    pub async fn executor_status(&self) -> Vec<crate::executor::ExecutorStatus> {
        self.registry.lock().await.status_snapshot(Instant::now())
    }

    /// Run until cancelled. Acquires the singleton lock first; lock
    /// contention is the only fatal startup condition.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        match self
            .lock
            .acquire()
            .await
            .map_err(|e| SupervisorError::Fatal(e.into()))?
        {
            Acquisition::Acquired => {}
            Acquisition::AcquiredUnlocked => {
                tracing::warn!("running without singleton lock");
            }
            Acquisition::AlreadyRunning { pid } => {
                return Err(SupervisorError::LockContention { pid });
            }
        }

        let mut cycle_timer = tokio::time::interval(self.config.cycle_interval);
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval);
        // The first tick of an interval fires immediately; let the
        // dispatch cycle go first.
        sweep_timer.reset_after(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested, releasing lock");
                    break;
                }
                _ = cycle_timer.tick() => {
                    let _guard = self.dispatch_mutex.lock().await;
                    if let Err(e) = self.run_cycle(&cancel).await {
                        tracing::warn!(error = %e, "dispatch cycle failed");
                    }
                }
                _ = sweep_timer.tick() => {
                    let _guard = self.dispatch_mutex.lock().await;
                    self.sweeper.sweep().await;
                }
            }
        }

        self.lock.release_if_owner();
        Ok(())
    }

    /// One dispatch cycle: sync the board, then dispatch every ready
    /// task sequentially.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        if let Some(kanban) = &self.kanban {
            match kanban.pull(&self.store).await {
                Ok(summary) if summary.imported > 0 => {
                    tracing::info!(imported = summary.imported, "imported external tasks");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "kanban pull failed"),
            }
        }

        for task in self.store.list_ready().await? {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.dispatch_task(&task).await?;
            if outcome == DispatchOutcome::Exhausted {
                let _ = self
                    .notifier
                    .notify(
                        "task failed",
                        &format!("task {} ({}) exhausted all executors", task.id, task.title),
                    )
                    .await;
            }
        }

        Ok(())
    }

    /// Dispatch one task: walk the candidate list up to `max_retries`.
    pub async fn dispatch_task(&self, task: &Task) -> anyhow::Result<DispatchOutcome> {
        let candidates = {
            let registry = self.registry.lock().await;
            let mut router = self.router.lock().await;
            router.pick(&registry, &task.title)
        };
        if candidates.is_empty() {
            tracing::warn!(task_id = %task.id, "no executor candidates available");
            return Ok(DispatchOutcome::NoCandidates);
        }

        let max_retries = self.router.lock().await.policy.max_retries as usize;

        for name in candidates.iter().take(max_retries) {
            match self.attempt_with(task, name).await? {
                AttemptResult::Succeeded => return Ok(DispatchOutcome::Completed),
                AttemptResult::Failed | AttemptResult::Unavailable => continue,
            }
        }

        Ok(DispatchOutcome::Exhausted)
    }

    async fn attempt_with(&self, task: &Task, profile_name: &str) -> anyhow::Result<AttemptResult> {
        let (sdk, variant) = {
            let registry = self.registry.lock().await;
            let Some(profile) = registry.by_name(profile_name) else {
                return Ok(AttemptResult::Unavailable);
            };
            (
                profile.executor.sdk_slug().to_string(),
                profile.variant.clone(),
            )
        };

        // The session id is per (task, attempt); use the task id until
        // the attempt token exists, then keep it for the whole attempt.
        let session_id = task.id.to_string();
        let decision = self
            .gate
            .enter(&sdk, &session_id, &task.title, EnterOptions::default());

        if let GateDecision::Rejected { reason } = &decision {
            tracing::info!(task_id = %task.id, profile = profile_name, %reason, "gate rejected");
            return Ok(AttemptResult::Unavailable);
        }

        // Refresh: the task may have moved since the cycle listed it.
        let task = self.store.get_task(task.id).await?;
        let attempt = match self
            .store
            .start_attempt(task.id, profile_name, None, None)
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                // The gate slot must not leak when the attempt never
                // materializes.
                self.gate.exit(&sdk, &session_id, SessionOutcome::Cancelled);
                return Err(e.into());
            }
        };
        let token = attempt.id;

        let result = self
            .execute_attempt(&task, token, &sdk, variant.as_deref(), &decision)
            .await;

        match result {
            Ok(()) => {
                self.gate.exit(&sdk, &session_id, SessionOutcome::Success);
                self.registry.lock().await.record_success(profile_name);
                self.store
                    .complete_attempt(token, AttemptOutcome::Success, None, TaskStatus::InReview)
                    .await?;
                self.mirror_task(task.id).await;
                tracing::info!(task_id = %task.id, profile = profile_name, "attempt succeeded");
                Ok(AttemptResult::Succeeded)
            }
            Err(failure) => {
                self.gate
                    .exit(&sdk, &session_id, SessionOutcome::TransientFailure);
                {
                    let mut registry = self.registry.lock().await;
                    let router = self.router.lock().await;
                    registry.record_failure(
                        profile_name,
                        router.policy.disable_on_consecutive_failures,
                        router.policy.cooldown(),
                        Instant::now(),
                    );
                }
                self.store
                    .complete_attempt(
                        token,
                        AttemptOutcome::Failure,
                        Some(&failure.kind.to_string()),
                        TaskStatus::Failed,
                    )
                    .await?;
                self.mirror_task(task.id).await;
                tracing::warn!(
                    task_id = %task.id,
                    profile = profile_name,
                    kind = %failure.kind,
                    error = %failure.message,
                    "attempt failed"
                );
                Ok(AttemptResult::Failed)
            }
        }
    }

    /// The body of one attempt: worktree, SDK call with heartbeats,
    /// commit, push. The worktree is released whatever happens.
    async fn execute_attempt(
        &self,
        task: &Task,
        token: Uuid,
        sdk: &str,
        variant: Option<&str>,
        decision: &GateDecision,
    ) -> Result<(), AttemptFailure> {
        let worktree = self
            .worktrees
            .allocate(token, &self.config.base_branch)
            .await
            .map_err(|e| AttemptFailure::new(FailureKind::GitFailure, e.to_string()))?;

        let _ = attempts::set_workspace(
            self.store.pool(),
            token,
            &worktree.branch,
            &worktree.path.to_string_lossy(),
        )
        .await;

        let result = match self
            .invoke_agent(task, token, sdk, variant, decision, &worktree.path)
            .await
        {
            Ok(_) => self.commit_and_push(task, &worktree).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.worktrees.release(&worktree).await {
            tracing::warn!(path = %worktree.path.display(), error = %e, "worktree release failed");
        }

        result
    }

    /// Run the SDK call, heartbeating the attempt while it is in flight.
    async fn invoke_agent(
        &self,
        task: &Task,
        token: Uuid,
        sdk: &str,
        variant: Option<&str>,
        decision: &GateDecision,
        working_dir: &std::path::Path,
    ) -> Result<SdkCompletion, AttemptFailure> {
        let prompt = build_prompt(task);

        let mut env = HashMap::new();
        env.insert("BOSUN_TASK_ID".to_string(), task.id.to_string());
        env.insert("BOSUN_MANAGED".to_string(), "1".to_string());

        let request = SdkRequest {
            sdk: sdk.to_string(),
            variant: variant.map(String::from),
            prompt,
            working_dir: Some(working_dir.to_path_buf()),
            env,
        };

        let call = async {
            match decision {
                GateDecision::Pooled => self.pool.exec_pooled(&request.prompt, sdk).await,
                _ => {
                    let client = self.clients.get(sdk).ok_or_else(|| {
                        anyhow::anyhow!("no SDK client registered for {sdk}")
                    })?;
                    client.execute(&request).await
                }
            }
        };
        tokio::pin!(call);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.reset_after(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                result = &mut call => {
                    return result.map_err(|e| {
                        AttemptFailure::new(FailureKind::SdkTransient, e.to_string())
                    });
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.heartbeat(token).await {
                        tracing::debug!(error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    /// Commit whatever the agent left in the worktree and push the
    /// attempt branch.
    async fn commit_and_push(
        &self,
        task: &Task,
        worktree: &crate::worktree::Worktree,
    ) -> Result<(), AttemptFailure> {
        let dirty = GitRepo::is_dirty_at(&worktree.path)
            .await
            .map_err(|e| AttemptFailure::new(FailureKind::GitFailure, e.to_string()))?;

        if dirty {
            GitRepo::run_in(&worktree.path, &["add", "-A"], crate::git::REMOVAL_TIMEOUT)
                .await
                .map_err(|e| AttemptFailure::new(FailureKind::GitFailure, e.to_string()))?;
            GitRepo::run_in(
                &worktree.path,
                &["commit", "-m", &task.title],
                crate::git::REMOVAL_TIMEOUT,
            )
            .await
            .map_err(|e| AttemptFailure::new(FailureKind::GitFailure, e.to_string()))?;
        }

        // Only push when the branch actually has commits over the base.
        let range = format!("{}..{}", self.config.base_branch, worktree.branch);
        let commits = self
            .repo
            .rev_list_count(&range)
            .await
            .map_err(|e| AttemptFailure::new(FailureKind::GitFailure, e.to_string()))?;
        if commits == 0 {
            return Err(AttemptFailure::new(
                FailureKind::HookRejected,
                "agent produced no commits".to_string(),
            ));
        }

        self.repo
            .push_branch(&worktree.branch)
            .await
            .map_err(|e| AttemptFailure::new(FailureKind::GitFailure, e.to_string()))?;
        Ok(())
    }

    async fn mirror_task(&self, task_id: Uuid) {
        let Some(kanban) = &self.kanban else {
            return;
        };
        match self.store.get_task(task_id).await {
            Ok(task) => {
                if let Err(e) = kanban.push_task(&task).await {
                    tracing::warn!(task_id = %task_id, error = %e, "kanban push failed");
                }
            }
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "task refresh failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptResult {
    Succeeded,
    Failed,
    Unavailable,
}

#[derive(Debug)]
struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl AttemptFailure {
    fn new(kind: FailureKind, message: String) -> Self {
        Self { kind, message }
    }
}

/// Build the agent prompt for a task.
fn build_prompt(task: &Task) -> String {
    format!(
        "You are working on the following task:\n\n{}\n\n\
         Make the necessary changes in the current directory and leave \
         the working tree ready to commit.",
        task.title
    )
}
