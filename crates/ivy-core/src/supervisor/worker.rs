//! Worker supervisor: the retry-bounded loop that drives one subtask's
//! implementation agent to completion.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ivy_db::models::{AgentKind, Project, RunStatus, Subtask, SubtaskStatus, Task};
use ivy_db::queries::agent_runs as run_db;
use ivy_db::queries::subtasks as subtask_db;

use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::hosting::{self, NewPullRequest};
use crate::launcher::LaunchRequest;
use crate::naming::pr_title;
use crate::state::dispatch;

use super::backoff::backoff_delay;
use super::SupervisorDeps;

/// Drive worker attempts until the subtask's issue is closed or the retry
/// budget is exhausted.
///
/// The retry counter records consumed attempts: it is incremented before
/// each attempt and never reset, so the budget check at the top of the
/// loop holds across live runs, user retries, and crash recovery.
pub async fn run_worker(
    deps: &SupervisorDeps,
    project: &Project,
    task: &Task,
    subtask_id: uuid::Uuid,
    access_token: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let clone_path = PathBuf::from(&project.clone_path);
    let max_retries = deps.config.agent_max_retries;

    loop {
        let subtask = subtask_db::get_subtask(&deps.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;

        if subtask.retry_count >= max_retries {
            info!(%subtask_id, retries = subtask.retry_count, "retry budget exhausted");
            block_failure(deps, project, &subtask).await?;
            return Ok(());
        }

        // Every attempt starts from the latest upstream state.
        deps.syncer
            .sync(project)
            .await
            .map_err(|e| CoreError::UpstreamFailure(format!("repository sync failed: {e:#}")))?;

        let attempt = subtask_db::increment_retry_count(&deps.pool, subtask_id).await?;

        let outcome = match attempt_once(deps, project, task, &subtask, attempt, access_token, &cancel)
            .await?
        {
            AttemptOutcome::Cancelled => return Ok(()),
            AttemptOutcome::Succeeded => return Ok(()),
            AttemptOutcome::Failed { run_id, reason } => (run_id, reason),
        };

        let (run_id, reason) = outcome;
        let will_retry = attempt < max_retries;

        deps.hub.publish(
            project.id,
            &Event::AgentFailed {
                run_id,
                task_id: None,
                subtask_id: Some(subtask_id),
                error: reason.clone(),
                will_retry,
            },
        );

        if !will_retry {
            let subtask = subtask_db::get_subtask(&deps.pool, subtask_id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;
            block_failure(deps, project, &subtask).await?;
            return Ok(());
        }

        let delay = backoff_delay(attempt as u32);
        info!(%subtask_id, attempt, ?delay, "backing off before retry");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                let subtask = subtask_db::get_subtask(&deps.pool, subtask_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;
                block_failure(deps, project, &subtask).await?;
                return Ok(());
            }
        }
    }
}

enum AttemptOutcome {
    Succeeded,
    Cancelled,
    Failed { run_id: uuid::Uuid, reason: String },
}

async fn attempt_once(
    deps: &SupervisorDeps,
    project: &Project,
    task: &Task,
    subtask: &Subtask,
    attempt: i32,
    access_token: &str,
    cancel: &CancellationToken,
) -> Result<AttemptOutcome> {
    let worktree = subtask
        .worktree_path
        .clone()
        .map(PathBuf::from)
        .ok_or_else(|| {
            CoreError::Unprocessable(format!("subtask {} has no working tree", subtask.id))
        })?;

    let prompt = crate::prompts::render_worker(subtask, project);
    let prompt_path = crate::paths::worker_prompt_path(
        &deps.config.data_dir,
        project.id,
        task.id,
        subtask.id,
    );
    crate::prompts::persist(&prompt_path, &prompt)?;

    let log_path = crate::paths::worker_log_path(
        &deps.config.data_dir,
        project.id,
        task.id,
        subtask.id,
        attempt,
    );

    let run = run_db::insert_run(
        &deps.pool,
        &run_db::NewAgentRun {
            task_id: None,
            subtask_id: Some(subtask.id),
            kind: AgentKind::Worker,
            attempt,
            log_path: log_path.to_string_lossy().into_owned(),
            prompt,
        },
    )
    .await?;

    deps.hub.publish(
        project.id,
        &Event::AgentStarted {
            run_id: run.id,
            kind: AgentKind::Worker,
            task_id: None,
            subtask_id: Some(subtask.id),
            attempt,
        },
    );

    let handle = deps
        .launcher
        .launch(
            LaunchRequest {
                work_dir: worktree.clone(),
                prompt_path,
                log_path: log_path.clone(),
                attempt,
            },
            cancel.clone(),
        )
        .await
        .map_err(|e| CoreError::ToolUnavailable(format!("failed to launch worker: {e:#}")))?;

    let tail = {
        let tailer = std::sync::Arc::clone(&deps.tailer);
        let token = cancel.clone();
        let project_id = project.id;
        let run_id = run.id;
        let log_path = log_path.clone();
        tokio::spawn(async move {
            if let Err(e) = tailer.start_tailing(token, project_id, run_id, &log_path).await {
                warn!(%run_id, error = %e, "worker log tail ended with error");
            }
        })
    };

    let outcome = handle.wait().await;
    deps.tailer.stop_tailing(run.id);
    let _ = tail.await;

    if outcome.tokens_used > 0 {
        subtask_db::add_tokens_used(&deps.pool, subtask.id, outcome.tokens_used).await?;
    }

    if cancel.is_cancelled() {
        run_db::finish_run(
            &deps.pool,
            run.id,
            RunStatus::Failed,
            outcome.tokens_used,
            Some("cancelled"),
        )
        .await?;
        deps.hub.publish(
            project.id,
            &Event::AgentFailed {
                run_id: run.id,
                task_id: None,
                subtask_id: Some(subtask.id),
                error: "cancelled".into(),
                will_retry: false,
            },
        );
        let fresh = subtask_db::get_subtask(&deps.pool, subtask.id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {}", subtask.id)))?;
        block_failure(deps, project, &fresh).await?;
        return Ok(AttemptOutcome::Cancelled);
    }

    // The agent's exit code is advisory; the contract is the tracker
    // issue. Closed issue = the work is done.
    let issue = deps
        .tracker
        .show_issue(Path::new(&project.clone_path), &subtask.issue_id, cancel)
        .await
        .map_err(|e| CoreError::ToolUnavailable(format!("tracker show failed: {e:#}")))?;

    if issue.is_closed() {
        run_db::finish_run(&deps.pool, run.id, RunStatus::Succeeded, outcome.tokens_used, None)
            .await?;
        let pr_url =
            finalize_success(deps, project, subtask, &worktree, access_token, run.id).await?;

        deps.hub.publish(
            project.id,
            &Event::AgentCompleted {
                run_id: run.id,
                task_id: None,
                subtask_id: Some(subtask.id),
                pr_url,
                tokens_used: outcome.tokens_used,
            },
        );
        return Ok(AttemptOutcome::Succeeded);
    }

    let reason = outcome
        .error
        .unwrap_or_else(|| "issue not closed".to_string());
    run_db::finish_run(
        &deps.pool,
        run.id,
        RunStatus::Failed,
        outcome.tokens_used,
        Some(&reason),
    )
    .await?;

    // Leave a trace on the issue so the next attempt's agent sees what
    // went wrong. Best-effort.
    if let Err(e) = deps
        .tracker
        .add_comment(
            Path::new(&project.clone_path),
            &subtask.issue_id,
            &format!("Attempt {attempt} failed: {reason}"),
            cancel,
        )
        .await
    {
        warn!(subtask_id = %subtask.id, error = %e, "failed to comment on issue");
    }

    Ok(AttemptOutcome::Failed {
        run_id: run.id,
        reason,
    })
}

/// Success path: best-effort branch push and PR creation, then the
/// `in_progress -> completed` transition. Push and PR failures are logged
/// but do not abort -- the subtask still completes, without a PR URL.
async fn finalize_success(
    deps: &SupervisorDeps,
    project: &Project,
    subtask: &Subtask,
    worktree: &Path,
    access_token: &str,
    run_id: uuid::Uuid,
) -> Result<Option<String>> {
    let mut pr_url = None;

    if let Some(branch) = subtask.branch_name.as_deref() {
        if let Err(e) = hosting::push_branch(worktree, branch).await {
            warn!(subtask_id = %subtask.id, %run_id, error = %e, "branch push failed (non-fatal)");
        } else {
            match open_pull_request(deps, project, subtask, worktree, access_token, branch).await {
                Ok(pr) => {
                    subtask_db::set_pull_request(&deps.pool, subtask.id, &pr.url, pr.number)
                        .await?;
                    pr_url = Some(pr.url);
                }
                Err(e) => {
                    warn!(subtask_id = %subtask.id, error = %e, "pull request creation failed (non-fatal)");
                }
            }
        }
    } else {
        warn!(subtask_id = %subtask.id, "no branch recorded, skipping push and PR");
    }

    dispatch::complete_subtask(&deps.pool, subtask.id).await?;
    deps.hub.publish(
        project.id,
        &Event::SubtaskStatusChanged {
            subtask_id: subtask.id,
            task_id: subtask.task_id,
            old_status: SubtaskStatus::InProgress,
            new_status: SubtaskStatus::Completed,
            blocked_reason: None,
        },
    );

    Ok(pr_url)
}

async fn open_pull_request(
    deps: &SupervisorDeps,
    project: &Project,
    subtask: &Subtask,
    worktree: &Path,
    access_token: &str,
    branch: &str,
) -> anyhow::Result<hosting::PullRequest> {
    let commits = hosting::commit_log_since(worktree, &project.default_branch).await?;
    let body = hosting::pr_body(&subtask.spec, &commits);

    deps.hosting
        .create_pull_request(
            access_token,
            &project.owner,
            &project.repo,
            &NewPullRequest {
                title: pr_title(subtask.id, &subtask.title),
                body,
                head: branch.to_string(),
                base: project.default_branch.clone(),
            },
        )
        .await
}

/// Terminal failure: `in_progress -> blocked(failure)` with its event.
async fn block_failure(deps: &SupervisorDeps, project: &Project, subtask: &Subtask) -> Result<()> {
    match dispatch::block_subtask_failure(&deps.pool, subtask.id).await {
        Ok(()) => {
            deps.hub.publish(
                project.id,
                &Event::SubtaskStatusChanged {
                    subtask_id: subtask.id,
                    task_id: subtask.task_id,
                    old_status: SubtaskStatus::InProgress,
                    new_status: SubtaskStatus::Blocked,
                    blocked_reason: Some(ivy_db::models::BlockedReason::Failure),
                },
            );
            Ok(())
        }
        // Someone else already moved it (e.g. the sync worker caught a
        // completion); leave their transition in place.
        Err(CoreError::Conflict(msg)) => {
            warn!(subtask_id = %subtask.id, %msg, "skip blocking, state moved concurrently");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
