//! Subtask lifecycle: start, retry, merge confirmation, reorder, delete.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use ivy_db::models::{BlockedReason, Project, Subtask, SubtaskStatus, Task};
use ivy_db::queries::projects as project_db;
use ivy_db::queries::subtasks as subtask_db;
use ivy_db::queries::tasks as task_db;

use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::naming::branch_name;
use crate::state::dispatch;
use crate::sync::propagate_unblocks;

use super::ServiceCtx;
use super::tasks::TaskService;

pub struct SubtaskService {
    ctx: ServiceCtx,
}

impl SubtaskService {
    pub fn new(ctx: ServiceCtx) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, subtask_id: Uuid) -> Result<Subtask> {
        subtask_db::get_subtask(&self.ctx.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))
    }

    pub async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<Subtask>> {
        Ok(subtask_db::list_subtasks_for_task(&self.ctx.pool, task_id).await?)
    }

    /// Start a `ready` subtask: sync the repo, create the working tree,
    /// transition to `in_progress`, and spawn the worker.
    pub async fn start(&self, subtask_id: Uuid) -> Result<()> {
        self.start_inner(subtask_id, SubtaskStatus::Ready, None).await
    }

    /// Retry a subtask blocked on failure.
    pub async fn retry(&self, subtask_id: Uuid) -> Result<()> {
        self.start_inner(
            subtask_id,
            SubtaskStatus::Blocked,
            Some(BlockedReason::Failure),
        )
        .await
    }

    async fn start_inner(
        &self,
        subtask_id: Uuid,
        expect_status: SubtaskStatus,
        expect_reason: Option<BlockedReason>,
    ) -> Result<()> {
        let subtask = self.get(subtask_id).await?;
        if subtask.status != expect_status || subtask.blocked_reason != expect_reason {
            return Err(CoreError::unprocessable(format!(
                "subtask {subtask_id} is {}, cannot start from here",
                subtask.status
            )));
        }
        let (task, project) = self.parents(&subtask).await?;

        // Agents start from the latest upstream state; a sync failure is
        // user-facing and nothing is spawned.
        self.ctx
            .syncer
            .sync(&project)
            .await
            .map_err(|e| CoreError::UpstreamFailure(format!("repository sync failed: {e:#}")))?;

        self.ensure_worktree(&project, &subtask).await?;

        // The optimistic lock in the transition is what makes concurrent
        // starts safe: the loser sees Conflict and no second AgentRun is
        // ever created.
        match expect_status {
            SubtaskStatus::Ready => dispatch::start_subtask(&self.ctx.pool, subtask_id).await?,
            _ => dispatch::retry_subtask(&self.ctx.pool, subtask_id).await?,
        }

        self.ctx.hub.publish(
            project.id,
            &Event::SubtaskStatusChanged {
                subtask_id,
                task_id: task.id,
                old_status: expect_status,
                new_status: SubtaskStatus::InProgress,
                blocked_reason: None,
            },
        );

        // Mirror the start into the tracker. Best-effort; the store is
        // already authoritative for our own status.
        if let Err(e) = self
            .ctx
            .tracker
            .update_issue_status(
                Path::new(&project.clone_path),
                &subtask.issue_id,
                "in_progress",
                &CancellationToken::new(),
            )
            .await
        {
            warn!(%subtask_id, error = %e, "failed to mark tracker issue in progress");
        }

        if let Err(e) = self.ctx.spawner.spawn_worker(subtask_id).await {
            // Give the state back so the user can try again.
            warn!(%subtask_id, error = %e, "worker spawn failed, reverting start");
            let _ = subtask_db::set_subtask_status(
                &self.ctx.pool,
                subtask_id,
                expect_status,
                expect_reason,
            )
            .await;
            return Err(e);
        }

        info!(%subtask_id, "subtask started");
        Ok(())
    }

    /// Create the working tree on the subtask's branch if it is not
    /// already in place. The tracker's worktree subcommand shares the root
    /// clone's database via a redirect file.
    async fn ensure_worktree(&self, project: &Project, subtask: &Subtask) -> Result<()> {
        let clone_path = Path::new(&project.clone_path);
        let worktree = crate::paths::worktree_dir(clone_path, subtask.id);

        if subtask.worktree_path.is_some() && worktree.exists() {
            return Ok(());
        }

        let branch = subtask
            .branch_name
            .clone()
            .unwrap_or_else(|| branch_name(&subtask.issue_id, &subtask.title));

        self.ctx
            .tracker
            .create_worktree(
                clone_path,
                &subtask.id.to_string(),
                &branch,
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| CoreError::ToolUnavailable(format!("worktree creation failed: {e:#}")))?;

        subtask_db::set_workspace(
            &self.ctx.pool,
            subtask.id,
            &branch,
            &worktree.to_string_lossy(),
        )
        .await?;
        Ok(())
    }

    /// User confirms the pull request merged: `completed -> merged`,
    /// unblock dependents, and close out the task if it was the last one.
    pub async fn mark_merged(&self, subtask_id: Uuid) -> Result<()> {
        let subtask = self.get(subtask_id).await?;
        if subtask.status != SubtaskStatus::Completed {
            return Err(CoreError::unprocessable(format!(
                "subtask {subtask_id} is {}, only completed subtasks can be merged",
                subtask.status
            )));
        }
        let (task, project) = self.parents(&subtask).await?;

        dispatch::mark_merged(&self.ctx.pool, subtask_id).await?;
        self.ctx.hub.publish(
            project.id,
            &Event::SubtaskStatusChanged {
                subtask_id,
                task_id: task.id,
                old_status: SubtaskStatus::Completed,
                new_status: SubtaskStatus::Merged,
                blocked_reason: None,
            },
        );

        // Working tree is no longer needed once the branch is merged.
        if subtask.worktree_path.is_some() {
            let ctx = CancellationToken::new();
            if let Err(e) = self
                .ctx
                .tracker
                .remove_worktree(
                    Path::new(&project.clone_path),
                    &subtask.id.to_string(),
                    &ctx,
                )
                .await
            {
                warn!(%subtask_id, error = %e, "failed to remove worktree (non-fatal)");
            }
        }

        propagate_unblocks(&self.ctx.pool, &self.ctx.hub, project.id, subtask_id).await?;

        TaskService::new(self.ctx.clone()).check_done(task.id).await?;
        Ok(())
    }

    /// Write an absolute position for user-controlled column ordering.
    pub async fn reorder(&self, subtask_id: Uuid, position: i32) -> Result<()> {
        if position < 0 {
            return Err(CoreError::InvalidRequest("position must be non-negative".into()));
        }
        let rows = subtask_db::set_position(&self.ctx.pool, subtask_id, position).await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!("subtask {subtask_id}")));
        }
        Ok(())
    }

    /// Delete a subtask: cancel its worker, delete the tracker issue
    /// (best-effort), then the record. Dependency edges cascade.
    pub async fn delete(&self, subtask_id: Uuid) -> Result<()> {
        let subtask = self.get(subtask_id).await?;
        let (_, project) = self.parents(&subtask).await?;

        self.ctx.spawner.kill_agents_for_subtask(subtask_id).await;

        let ctx = CancellationToken::new();
        if let Err(e) = self
            .ctx
            .tracker
            .delete_issue(
                Path::new(&project.clone_path),
                &subtask.issue_id,
                false,
                &ctx,
            )
            .await
        {
            warn!(%subtask_id, error = %e, "failed to delete tracker issue (non-fatal)");
        }

        let rows = subtask_db::delete_subtask(&self.ctx.pool, subtask_id).await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!("subtask {subtask_id}")));
        }
        Ok(())
    }

    async fn parents(&self, subtask: &Subtask) -> Result<(Task, Project)> {
        let task = task_db::get_task(&self.ctx.pool, subtask.task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {}", subtask.task_id)))?;
        let project = project_db::get_project(&self.ctx.pool, task.project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {}", task.project_id)))?;
        Ok((task, project))
    }
}
