//! Integration tests for the service layer: start/retry validation, merge
//! confirmation with unblock propagation, and task completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ivy_core::config::CoreConfig;
use ivy_core::credentials::StaticCredentials;
use ivy_core::error::{CoreError, Result};
use ivy_core::events::{Event, EventHub, LogSubscription};
use ivy_core::hosting::{HostingApi, NewPullRequest, PullRequest, RepoSyncer};
use ivy_core::manager::AgentSpawner;
use ivy_core::service::subtasks::SubtaskService;
use ivy_core::service::tasks::TaskService;
use ivy_core::service::ServiceCtx;
use ivy_core::tracker::TrackerAdapter;
use ivy_core::tracker::types::Issue;
use ivy_db::models::{BlockedReason, SubtaskStatus, TaskStatus};
use ivy_db::queries::{subtasks as subtask_db, tasks as task_db};

use ivy_test_utils::{TestDb, seed_project, seed_subtask, seed_task};

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSpawner {
    workers: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl AgentSpawner for RecordingSpawner {
    async fn spawn_planner(&self, _task_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn spawn_worker(&self, subtask_id: Uuid) -> Result<()> {
        self.workers.lock().unwrap().push(subtask_id);
        Ok(())
    }

    async fn kill_agents_for_task(&self, _task_id: Uuid) {}

    async fn kill_agents_for_subtask(&self, _subtask_id: Uuid) {}
}

/// Tracker that records worktree creations and accepts everything else.
#[derive(Default)]
struct NullTracker {
    worktrees: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl TrackerAdapter for NullTracker {
    async fn init(&self, _: &Path, _: &str, _: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_epic(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<String> {
        Ok("iv-0".into())
    }

    async fn create_task_issue(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<String> {
        Ok("iv-1".into())
    }

    async fn add_dependency(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_issues(
        &self,
        _: &Path,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<Vec<Issue>> {
        Ok(Vec::new())
    }

    async fn show_issue(
        &self,
        _: &Path,
        issue_id: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<Issue> {
        anyhow::bail!("no such issue {issue_id}")
    }

    async fn close_issue(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_issue_status(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_issue(
        &self,
        _: &Path,
        _: &str,
        _: bool,
        _: &CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_worktree(
        &self,
        _: &Path,
        name: &str,
        branch: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.worktrees
            .lock()
            .unwrap()
            .insert(name.to_string(), branch.to_string());
        Ok(())
    }

    async fn remove_worktree(&self, _: &Path, _: &str, _: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn find_epic_by_task_id(
        &self,
        _: &Path,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<Option<Issue>> {
        Ok(None)
    }

    async fn add_comment(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct NullHosting;

#[async_trait]
impl HostingApi for NullHosting {
    async fn create_fork(&self, _: &str, _: &str, _: &str) -> anyhow::Result<String> {
        Ok("me/fork".into())
    }

    async fn create_pull_request(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &NewPullRequest,
    ) -> anyhow::Result<PullRequest> {
        anyhow::bail!("not used")
    }

    async fn default_branch(&self, _: &str, _: &str, _: &str) -> anyhow::Result<String> {
        Ok("main".into())
    }
}

fn git_fixture(root: &Path) -> PathBuf {
    let origin = root.join("origin.git");
    let clone = root.join("clone");

    let sh = |dir: &Path, args: &[&str]| {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    };

    std::fs::create_dir_all(&origin).unwrap();
    sh(&origin, &["init", "--bare", "--initial-branch=main", "."]);

    let seed = root.join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    sh(&seed, &["init", "--initial-branch=main", "."]);
    sh(&seed, &["config", "user.email", "test@ivy.dev"]);
    sh(&seed, &["config", "user.name", "Ivy Test"]);
    std::fs::write(seed.join("README.md"), "# seed\n").unwrap();
    sh(&seed, &["add", "."]);
    sh(&seed, &["commit", "-m", "initial"]);
    sh(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]);
    sh(&seed, &["push", "origin", "main"]);

    let out = std::process::Command::new("git")
        .args(["clone", origin.to_str().unwrap(), clone.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(out.status.success());

    clone
}

fn ctx(
    pool: sqlx::PgPool,
    data_dir: &Path,
    spawner: Arc<RecordingSpawner>,
    tracker: Arc<NullTracker>,
) -> (ServiceCtx, Arc<EventHub>) {
    let hub = Arc::new(EventHub::new(256, 5));
    let config = CoreConfig::new(vec![0xaa; 32], vec![0x55; 32])
        .unwrap()
        .with_data_dir(data_dir);
    (
        ServiceCtx {
            pool,
            hub: Arc::clone(&hub),
            tracker,
            hosting: Arc::new(NullHosting),
            spawner,
            credentials: Arc::new(StaticCredentials::new("token")),
            syncer: RepoSyncer::new().with_retry_base(Duration::from_millis(1)),
            config,
        },
        hub,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_requires_ready_status() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await; // pending

    let spawner = Arc::new(RecordingSpawner::default());
    let (ctx, _hub) = ctx(pool.clone(), tmp.path(), spawner.clone(), Arc::default());
    let service = SubtaskService::new(ctx);

    let result = service.start(subtask.id).await;
    assert!(matches!(result, Err(CoreError::Unprocessable(_))));
    assert!(spawner.workers.lock().unwrap().is_empty());

    db.finish().await;
}

#[tokio::test]
async fn start_creates_worktree_and_spawns() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await;
    subtask_db::set_subtask_status(&pool, subtask.id, SubtaskStatus::Ready, None)
        .await
        .unwrap();

    let spawner = Arc::new(RecordingSpawner::default());
    let tracker = Arc::new(NullTracker::default());
    let (ctx, hub) = ctx(pool.clone(), tmp.path(), spawner.clone(), tracker.clone());
    let mut sub = hub
        .subscribe(project.id, Uuid::new_v4(), LogSubscription::All)
        .unwrap();
    let service = SubtaskService::new(ctx);

    service.start(subtask.id).await.unwrap();

    let fresh = subtask_db::get_subtask(&pool, subtask.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, SubtaskStatus::InProgress);
    assert_eq!(fresh.branch_name.as_deref(), Some("iv-1-unit-iv-1"));
    assert!(fresh.worktree_path.is_some());

    // The worktree was created through the tracker, named for the subtask.
    let worktrees = tracker.worktrees.lock().unwrap();
    assert_eq!(
        worktrees.get(&subtask.id.to_string()).map(String::as_str),
        Some("iv-1-unit-iv-1")
    );

    assert_eq!(*spawner.workers.lock().unwrap(), vec![subtask.id]);

    let mut saw_status_change = false;
    while let Ok(event) = sub.rx.try_recv() {
        if let Event::SubtaskStatusChanged { new_status, .. } = event {
            assert_eq!(new_status, SubtaskStatus::InProgress);
            saw_status_change = true;
        }
    }
    assert!(saw_status_change);

    db.finish().await;
}

#[tokio::test]
async fn concurrent_service_starts_admit_one() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await;
    subtask_db::set_subtask_status(&pool, subtask.id, SubtaskStatus::Ready, None)
        .await
        .unwrap();

    let spawner = Arc::new(RecordingSpawner::default());
    let (ctx, _hub) = ctx(pool.clone(), tmp.path(), spawner.clone(), Arc::default());
    let service = Arc::new(SubtaskService::new(ctx));

    let (a, b) = tokio::join!(service.start(subtask.id), service.start(subtask.id));
    let ok = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "exactly one start wins");

    // Exactly one worker spawn happened.
    assert_eq!(spawner.workers.lock().unwrap().len(), 1);

    db.finish().await;
}

#[tokio::test]
async fn mark_merged_unblocks_and_finishes_task() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;
    task_db::transition_task_status(&pool, task.id, TaskStatus::Planning, TaskStatus::Active)
        .await
        .unwrap();

    let a = seed_subtask(&pool, task.id, "iv-1").await;
    let b = seed_subtask(&pool, task.id, "iv-2").await;
    subtask_db::insert_dependency(&pool, b.id, a.id).await.unwrap();
    subtask_db::set_subtask_status(&pool, a.id, SubtaskStatus::Completed, None)
        .await
        .unwrap();
    subtask_db::set_subtask_status(
        &pool,
        b.id,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Dependency),
    )
    .await
    .unwrap();

    let spawner = Arc::new(RecordingSpawner::default());
    let (ctx, hub) = ctx(pool.clone(), tmp.path(), spawner, Arc::default());
    let mut sub = hub
        .subscribe(project.id, Uuid::new_v4(), LogSubscription::All)
        .unwrap();
    let service = SubtaskService::new(ctx.clone());

    // Merging a unblocks b; the task is not yet done.
    service.mark_merged(a.id).await.unwrap();

    let fresh_b = subtask_db::get_subtask(&pool, b.id).await.unwrap().unwrap();
    assert_eq!(fresh_b.status, SubtaskStatus::Ready);

    let fresh_task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fresh_task.status, TaskStatus::Active);

    let mut saw_unblocked = false;
    while let Ok(event) = sub.rx.try_recv() {
        if let Event::SubtaskUnblocked { unblocked_by, .. } = event {
            assert_eq!(unblocked_by, a.id);
            saw_unblocked = true;
        }
    }
    assert!(saw_unblocked);

    // Completing and merging b finishes the task.
    subtask_db::set_subtask_status(&pool, b.id, SubtaskStatus::Completed, None)
        .await
        .unwrap();
    service.mark_merged(b.id).await.unwrap();

    let fresh_task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fresh_task.status, TaskStatus::Done);

    db.finish().await;
}

#[tokio::test]
async fn mark_merged_requires_completed() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await;

    let spawner = Arc::new(RecordingSpawner::default());
    let (ctx, _hub) = ctx(pool.clone(), tmp.path(), spawner, Arc::default());
    let service = SubtaskService::new(ctx);

    let result = service.mark_merged(subtask.id).await;
    assert!(matches!(result, Err(CoreError::Unprocessable(_))));

    db.finish().await;
}

#[tokio::test]
async fn reorder_writes_absolute_positions() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;
    let a = seed_subtask(&pool, task.id, "iv-1").await;
    let b = seed_subtask(&pool, task.id, "iv-2").await;

    let spawner = Arc::new(RecordingSpawner::default());
    let (ctx, _hub) = ctx(pool.clone(), tmp.path(), spawner, Arc::default());
    let service = SubtaskService::new(ctx);

    service.reorder(a.id, 10).await.unwrap();
    assert!(matches!(
        service.reorder(b.id, -1).await,
        Err(CoreError::InvalidRequest(_))
    ));
    assert!(matches!(
        service.reorder(Uuid::new_v4(), 1).await,
        Err(CoreError::NotFound(_))
    ));

    let ordered = subtask_db::list_subtasks_for_task(&pool, task.id).await.unwrap();
    assert_eq!(ordered.last().unwrap().id, a.id);

    db.finish().await;
}

#[tokio::test]
async fn retry_planning_requires_planning_failed() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let tmp = tempfile::tempdir().unwrap();
    let clone = git_fixture(tmp.path());

    let project = seed_project(&pool, clone.to_str().unwrap()).await;
    let task = seed_task(&pool, project.id).await;

    let spawner = Arc::new(RecordingSpawner::default());
    let (ctx, _hub) = ctx(pool.clone(), tmp.path(), spawner, Arc::default());
    let service = TaskService::new(ctx);

    // Still planning: retry is unprocessable.
    let result = service.retry_planning(task.id).await;
    assert!(matches!(result, Err(CoreError::Unprocessable(_))));

    // After a failure it goes through.
    task_db::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Planning,
        TaskStatus::PlanningFailed,
    )
    .await
    .unwrap();
    service.retry_planning(task.id).await.unwrap();

    let fresh = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, TaskStatus::Planning);

    db.finish().await;
}
