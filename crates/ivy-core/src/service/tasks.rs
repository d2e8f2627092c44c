//! Task submission, planning retry, completion check, and deletion.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use ivy_db::models::{Task, TaskStatus};
use ivy_db::queries::projects as project_db;
use ivy_db::queries::tasks as task_db;

use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::state::dispatch;

use super::ServiceCtx;

pub struct TaskService {
    ctx: ServiceCtx,
}

impl TaskService {
    pub fn new(ctx: ServiceCtx) -> Self {
        Self { ctx }
    }

    /// Submit a task: create it in `planning` and spawn the planner.
    ///
    /// The repository is synced before any agent is spawned; if the sync
    /// exhausts its retries, the action fails and the task stays in
    /// `planning` for an explicit retry.
    pub async fn create(&self, project_id: Uuid, title: &str, description: &str) -> Result<Task> {
        if title.trim().is_empty() {
            return Err(CoreError::InvalidRequest("task title must be non-empty".into()));
        }
        let project = project_db::get_project(&self.ctx.pool, project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {project_id}")))?;

        let task = task_db::insert_task(&self.ctx.pool, project_id, title, description).await?;

        self.ctx
            .syncer
            .sync(&project)
            .await
            .map_err(|e| CoreError::UpstreamFailure(format!("repository sync failed: {e:#}")))?;

        self.ctx.spawner.spawn_planner(task.id).await?;
        info!(task_id = %task.id, "task created, planner spawned");
        Ok(task)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task> {
        task_db::get_task(&self.ctx.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))
    }

    pub async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Task>> {
        Ok(task_db::list_tasks_for_project(&self.ctx.pool, project_id).await?)
    }

    /// Retry planning after a failed run:
    /// `planning_failed -> planning`, then a fresh planner.
    pub async fn retry_planning(&self, task_id: Uuid) -> Result<()> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::PlanningFailed {
            return Err(CoreError::unprocessable(format!(
                "task {task_id} is {}, only planning_failed tasks can retry planning",
                task.status
            )));
        }
        let project = project_db::get_project(&self.ctx.pool, task.project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {}", task.project_id)))?;

        dispatch::retry_planning(&self.ctx.pool, task_id).await?;
        self.ctx.hub.publish(
            project.id,
            &Event::TaskStatusChanged {
                task_id,
                old_status: TaskStatus::PlanningFailed,
                new_status: TaskStatus::Planning,
            },
        );

        self.ctx
            .syncer
            .sync(&project)
            .await
            .map_err(|e| CoreError::UpstreamFailure(format!("repository sync failed: {e:#}")))?;

        self.ctx.spawner.spawn_planner(task_id).await
    }

    /// If every subtask is merged (and there is at least one), transition
    /// `active -> done`. Called after a subtask reaches `merged`.
    pub async fn check_done(&self, task_id: Uuid) -> Result<bool> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::Active {
            return Ok(false);
        }
        if !task_db::all_subtasks_merged(&self.ctx.pool, task_id).await? {
            return Ok(false);
        }

        dispatch::finish_task(&self.ctx.pool, task_id).await?;
        self.ctx.hub.publish(
            task.project_id,
            &Event::TaskStatusChanged {
                task_id,
                old_status: TaskStatus::Active,
                new_status: TaskStatus::Done,
            },
        );
        info!(%task_id, "all subtasks merged, task done");
        Ok(true)
    }

    /// Delete a task: cancel its agents, delete the tracker epic
    /// (best-effort, cascading), then the record.
    pub async fn delete(&self, task_id: Uuid) -> Result<()> {
        let task = self.get(task_id).await?;
        let project = project_db::get_project(&self.ctx.pool, task.project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {}", task.project_id)))?;

        self.ctx.spawner.kill_agents_for_task(task_id).await;

        if let Some(epic_id) = &task.epic_id {
            let ctx = CancellationToken::new();
            if let Err(e) = self
                .ctx
                .tracker
                .delete_issue(std::path::Path::new(&project.clone_path), epic_id, true, &ctx)
                .await
            {
                warn!(%task_id, error = %e, "failed to delete tracker epic (non-fatal)");
            }
        }

        let rows = task_db::delete_task(&self.ctx.pool, task_id).await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!("task {task_id}")));
        }
        Ok(())
    }
}
