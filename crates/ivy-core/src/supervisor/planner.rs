//! Planner supervisor: a single attempt that decomposes a task into
//! tracker issues and mirrors them into the store.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ivy_db::models::{AgentKind, Project, RunStatus, Task, TaskStatus};
use ivy_db::queries::agent_runs as run_db;
use ivy_db::queries::tasks as task_db;

use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::launcher::LaunchRequest;
use crate::naming::short_tag;
use crate::state::dispatch;
use crate::sync::sync_task_from_tracker;
use crate::{paths, prompts};

use super::SupervisorDeps;

/// Drive one planner attempt to completion.
///
/// Planners are one-shot by design: a failed run transitions the task to
/// `planning_failed` and the user retries explicitly.
pub async fn run_planner(
    deps: &SupervisorDeps,
    project: &Project,
    task: &Task,
    cancel: CancellationToken,
) -> Result<()> {
    let clone_path = PathBuf::from(&project.clone_path);

    // Agents always start from the latest upstream state.
    deps.syncer
        .sync(project)
        .await
        .map_err(|e| CoreError::UpstreamFailure(format!("repository sync failed: {e:#}")))?;

    // Render and persist the instruction document.
    let prompt = prompts::render_planner(task, project);
    let prompt_path = paths::planner_prompt_path(&deps.config.data_dir, project.id, task.id);
    prompts::persist(&prompt_path, &prompt)?;

    let log_path = paths::planner_log_path(&deps.config.data_dir, project.id, task.id, 1);

    let run = run_db::insert_run(
        &deps.pool,
        &run_db::NewAgentRun {
            task_id: Some(task.id),
            subtask_id: None,
            kind: AgentKind::Planner,
            attempt: 1,
            log_path: log_path.to_string_lossy().into_owned(),
            prompt: prompt.clone(),
        },
    )
    .await?;

    deps.hub.publish(
        project.id,
        &Event::AgentStarted {
            run_id: run.id,
            kind: AgentKind::Planner,
            task_id: Some(task.id),
            subtask_id: None,
            attempt: 1,
        },
    );

    // The planner works in the project's root clone, not a working tree.
    let handle = deps
        .launcher
        .launch(
            LaunchRequest {
                work_dir: clone_path.clone(),
                prompt_path,
                log_path: log_path.clone(),
                attempt: 1,
            },
            cancel.clone(),
        )
        .await
        .map_err(|e| CoreError::ToolUnavailable(format!("failed to launch planner: {e:#}")))?;

    // Tail the log concurrently with the run.
    let tail = {
        let tailer = std::sync::Arc::clone(&deps.tailer);
        let token = cancel.clone();
        let project_id = project.id;
        let run_id = run.id;
        let log_path = log_path.clone();
        tokio::spawn(async move {
            if let Err(e) = tailer.start_tailing(token, project_id, run_id, &log_path).await {
                warn!(%run_id, error = %e, "planner log tail ended with error");
            }
        })
    };

    let outcome = handle.wait().await;
    deps.tailer.stop_tailing(run.id);
    let _ = tail.await;

    if cancel.is_cancelled() {
        run_db::finish_run(&deps.pool, run.id, RunStatus::Failed, outcome.tokens_used, Some("cancelled"))
            .await?;
        deps.hub.publish(
            project.id,
            &Event::AgentFailed {
                run_id: run.id,
                task_id: Some(task.id),
                subtask_id: None,
                error: "cancelled".into(),
                will_retry: false,
            },
        );
        // The task stays in planning; recovery or the user picks it up.
        return Ok(());
    }

    if outcome.exit_code == Some(0) {
        match locate_and_sync(deps, project, task, &clone_path, &cancel).await {
            Ok(epic_id) => {
                dispatch::activate_task(&deps.pool, task.id).await?;
                run_db::finish_run(
                    &deps.pool,
                    run.id,
                    RunStatus::Succeeded,
                    outcome.tokens_used,
                    None,
                )
                .await?;

                deps.hub.publish(
                    project.id,
                    &Event::TaskStatusChanged {
                        task_id: task.id,
                        old_status: TaskStatus::Planning,
                        new_status: TaskStatus::Active,
                    },
                );
                deps.hub.publish(
                    project.id,
                    &Event::AgentCompleted {
                        run_id: run.id,
                        task_id: Some(task.id),
                        subtask_id: None,
                        pr_url: None,
                        tokens_used: outcome.tokens_used,
                    },
                );
                info!(task_id = %task.id, epic = %epic_id, "planner succeeded");
                return Ok(());
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "planner postprocessing failed");
                fail(deps, project, task, run.id, outcome.tokens_used, &format!("{e}")).await?;
                return Ok(());
            }
        }
    }

    let reason = outcome
        .error
        .unwrap_or_else(|| "planner exited unsuccessfully".to_string());
    fail(deps, project, task, run.id, outcome.tokens_used, &reason).await?;
    Ok(())
}

/// Locate the epic by the task tag, record it, and mirror its issues.
async fn locate_and_sync(
    deps: &SupervisorDeps,
    project: &Project,
    task: &Task,
    clone_path: &Path,
    cancel: &CancellationToken,
) -> Result<String> {
    let tag = short_tag(task.id);
    let epic = deps
        .tracker
        .find_epic_by_task_id(clone_path, &tag, cancel)
        .await
        .map_err(|e| CoreError::ToolUnavailable(format!("epic lookup failed: {e:#}")))?
        .ok_or_else(|| {
            CoreError::Unprocessable(format!(
                "planner run produced no closed epic tagged {tag}"
            ))
        })?;

    task_db::set_task_epic(&deps.pool, task.id, &epic.id).await?;
    sync_task_from_tracker(
        &deps.pool,
        deps.tracker.as_ref(),
        &deps.hub,
        task.id,
        clone_path,
        cancel,
    )
    .await?;
    Ok(epic.id)
}

/// Shared failure path: mark the run failed, the task planning_failed, and
/// publish the terminal events.
async fn fail(
    deps: &SupervisorDeps,
    project: &Project,
    task: &Task,
    run_id: uuid::Uuid,
    tokens_used: i64,
    reason: &str,
) -> Result<()> {
    run_db::finish_run(&deps.pool, run_id, RunStatus::Failed, tokens_used, Some(reason)).await?;
    dispatch::fail_planning(&deps.pool, task.id).await?;

    deps.hub.publish(
        project.id,
        &Event::TaskStatusChanged {
            task_id: task.id,
            old_status: TaskStatus::Planning,
            new_status: TaskStatus::PlanningFailed,
        },
    );
    deps.hub.publish(
        project.id,
        &Event::AgentFailed {
            run_id,
            task_id: Some(task.id),
            subtask_id: None,
            error: reason.to_string(),
            will_retry: false,
        },
    );
    Ok(())
}
