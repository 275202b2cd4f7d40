//! Integration tests for the kanban sync core against an in-memory
//! backend: import, policy enforcement, label merging, and write
//! idempotency.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use bosun_core::kanban::{
    BackendError, ExternalItem, KanbanBackend, KanbanSync, SharedState, SyncPolicy,
};
use bosun_core::taskstore::TaskStore;
use bosun_db::models::{KanbanBackendKind, TaskStatus};
use bosun_test_utils::create_test_db;

/// In-memory backend that records every write.
#[derive(Default)]
struct FakeBackend {
    items: Mutex<Vec<ExternalItem>>,
    status_writes: Mutex<Vec<(String, TaskStatus)>>,
    label_writes: Mutex<Vec<(String, Vec<String>)>>,
    comments: Mutex<Vec<(String, String)>>,
    next_id: Mutex<u64>,
}

impl FakeBackend {
    fn with_items(items: Vec<ExternalItem>) -> Arc<Self> {
        let backend = Self::default();
        *backend.items.lock().unwrap() = items;
        Arc::new(backend)
    }

    fn status_writes(&self) -> Vec<(String, TaskStatus)> {
        self.status_writes.lock().unwrap().clone()
    }
}

fn external(id: &str, title: &str, status: TaskStatus, labels: &[&str]) -> ExternalItem {
    ExternalItem {
        id: id.to_string(),
        url: format!("https://board.example/{id}"),
        title: title.to_string(),
        status: Some(status),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        shared_state: None,
    }
}

#[async_trait]
impl KanbanBackend for FakeBackend {
    fn kind(&self) -> KanbanBackendKind {
        KanbanBackendKind::VibeKanban
    }

    async fn fetch_items(&self) -> Result<Vec<ExternalItem>, BackendError> {
        Ok(self.items.lock().unwrap().clone())
    }

    async fn create_item(
        &self,
        title: &str,
        labels: &[String],
    ) -> Result<ExternalItem, BackendError> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let item = external(
            &format!("created-{}", *next),
            title,
            TaskStatus::Todo,
            &labels.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        );
        self.items.lock().unwrap().push(item.clone());
        Ok(item)
    }

    async fn update_status(
        &self,
        external_id: &str,
        status: TaskStatus,
    ) -> Result<(), BackendError> {
        self.status_writes
            .lock()
            .unwrap()
            .push((external_id.to_string(), status));
        Ok(())
    }

    async fn add_labels(
        &self,
        external_id: &str,
        labels: &[String],
    ) -> Result<(), BackendError> {
        self.label_writes
            .lock()
            .unwrap()
            .push((external_id.to_string(), labels.to_vec()));
        Ok(())
    }

    async fn write_shared_state(
        &self,
        external_id: &str,
        state: &SharedState,
    ) -> Result<(), BackendError> {
        self.comments
            .lock()
            .unwrap()
            .push((external_id.to_string(), state.to_json()));
        Ok(())
    }

    async fn add_comment(&self, external_id: &str, body: &str) -> Result<(), BackendError> {
        self.comments
            .lock()
            .unwrap()
            .push((external_id.to_string(), body.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn pull_imports_unmirrored_items() {
    let (pool, _dir) = create_test_db().await;
    let store = TaskStore::new(pool.clone(), "inst-1");
    let backend = FakeBackend::with_items(vec![
        external("e-1", "feat(api): from the board", TaskStatus::Todo, &["bosun"]),
        external("e-2", "fix: another", TaskStatus::Todo, &["bosun", "bug"]),
    ]);
    let sync = KanbanSync::new(pool, Arc::clone(&backend) as Arc<dyn KanbanBackend>, SyncPolicy::default());

    let summary = sync.pull(&store).await.unwrap();
    assert_eq!(summary.imported, 2);

    let tasks = store.list_tasks(false).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let imported = tasks
        .iter()
        .find(|t| t.title == "feat(api): from the board")
        .unwrap();
    // Canonical labels are enforced on import.
    assert!(imported.labels.0.contains(&"bosun".to_string()));
    assert!(imported.labels.0.contains(&"codex-monitor".to_string()));

    // A second pull is a no-op.
    let summary = sync.pull(&store).await.unwrap();
    assert_eq!(summary.imported, 0);
    assert_eq!(store.list_tasks(false).await.unwrap().len(), 2);
}

#[tokio::test]
async fn internal_primary_ignores_external_status_edits() {
    let (pool, _dir) = create_test_db().await;
    let store = TaskStore::new(pool.clone(), "inst-1");
    let backend = FakeBackend::with_items(vec![external(
        "e-1",
        "fix: thing",
        TaskStatus::Todo,
        &["bosun"],
    )]);
    let sync = KanbanSync::new(
        pool,
        Arc::clone(&backend) as Arc<dyn KanbanBackend>,
        SyncPolicy::InternalPrimary,
    );

    sync.pull(&store).await.unwrap();
    let task_id = store.list_tasks(false).await.unwrap()[0].id;

    // Someone drags the card to Done on the board.
    backend.items.lock().unwrap()[0].status = Some(TaskStatus::Done);
    let summary = sync.pull(&store).await.unwrap();
    assert_eq!(summary.status_applied, 0);
    assert_eq!(summary.status_ignored, 1);

    // Internal status is untouched.
    let task = store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
}

#[tokio::test]
async fn bidirectional_applies_valid_transitions_only() {
    let (pool, _dir) = create_test_db().await;
    let store = TaskStore::new(pool.clone(), "inst-1");
    let backend = FakeBackend::with_items(vec![external(
        "e-1",
        "fix: thing",
        TaskStatus::Todo,
        &["bosun"],
    )]);
    let sync = KanbanSync::new(
        pool,
        Arc::clone(&backend) as Arc<dyn KanbanBackend>,
        SyncPolicy::Bidirectional,
    );

    sync.pull(&store).await.unwrap();
    let task_id = store.list_tasks(false).await.unwrap()[0].id;

    // todo -> cancelled is a valid edge; the board drives it.
    backend.items.lock().unwrap()[0].status = Some(TaskStatus::Cancelled);
    let summary = sync.pull(&store).await.unwrap();
    assert_eq!(summary.status_applied, 1);
    assert_eq!(
        store.get_task(task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    // cancelled is terminal; a later board edit cannot resurrect it.
    backend.items.lock().unwrap()[0].status = Some(TaskStatus::InProgress);
    let summary = sync.pull(&store).await.unwrap();
    assert_eq!(summary.status_applied, 0);
    assert_eq!(summary.status_ignored, 1);
    assert_eq!(
        store.get_task(task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn push_creates_mirror_and_is_idempotent_per_attempt() {
    let (pool, _dir) = create_test_db().await;
    let store = TaskStore::new(pool.clone(), "inst-1");
    let backend = Arc::new(FakeBackend::default());
    let sync = KanbanSync::new(
        pool,
        Arc::clone(&backend) as Arc<dyn KanbanBackend>,
        SyncPolicy::InternalPrimary,
    );

    let task = store
        .create_task("feat(api): outbound", &["bug".into()], None, None)
        .await
        .unwrap();

    let task_row = store.get_task(task.id).await.unwrap();
    sync.push_task(&task_row).await.unwrap();
    // Replay of the same state: the status write must not repeat.
    sync.push_task(&task_row).await.unwrap();

    assert_eq!(backend.status_writes().len(), 1);

    // The labels sent outward include the canonical pair.
    let labels = backend.label_writes.lock().unwrap().last().unwrap().1.clone();
    assert!(labels.contains(&"bosun".to_string()));
    assert!(labels.contains(&"codex-monitor".to_string()));
    assert!(labels.contains(&"bug".to_string()));

    // A new attempt is a new correlation id: the next status write goes
    // through.
    let attempt = store
        .start_attempt(task.id, "codex-default", None, None)
        .await
        .unwrap();
    let task_row = store.get_task(task.id).await.unwrap();
    assert_eq!(task_row.attempt_token, Some(attempt.id));
    sync.push_task(&task_row).await.unwrap();
    sync.push_task(&task_row).await.unwrap();

    let writes = backend.status_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].1, TaskStatus::InProgress);
}

#[tokio::test]
async fn comment_once_suppresses_replays() {
    let (pool, _dir) = create_test_db().await;
    let store = TaskStore::new(pool.clone(), "inst-1");
    let backend = Arc::new(FakeBackend::default());
    let sync = KanbanSync::new(
        pool,
        Arc::clone(&backend) as Arc<dyn KanbanBackend>,
        SyncPolicy::InternalPrimary,
    );

    let task = store.create_task("fix: y", &[], None, None).await.unwrap();
    let task_row = store.get_task(task.id).await.unwrap();
    sync.push_task(&task_row).await.unwrap();

    assert!(sync.comment_once(&task_row, "result", "attempt done").await.unwrap());
    assert!(!sync.comment_once(&task_row, "result", "attempt done").await.unwrap());

    let comments = backend.comments.lock().unwrap();
    let result_comments: Vec<_> = comments
        .iter()
        .filter(|(_, body)| body == "attempt done")
        .collect();
    assert_eq!(result_comments.len(), 1);
}
