//! Sync reconciler: bidirectional state propagation between the tracker
//! and the durable store.
//!
//! The tracker is the source of truth for subtask existence, titles,
//! descriptions, and blocking edges; the store mirrors them after each
//! planner success and periodically during work.

pub mod issue_body;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ivy_db::models::{BlockedReason, SubtaskStatus};
use ivy_db::queries::projects as project_db;
use ivy_db::queries::subtasks as subtask_db;
use ivy_db::queries::tasks as task_db;

use crate::error::{CoreError, Result};
use crate::events::{Event, EventHub};
use crate::state::dispatch;
use crate::tracker::TrackerAdapter;
use crate::tracker::types::{Issue, IssueType};

use issue_body::parse_issue_body;

/// Mirror a task's epic from the tracker into the durable store.
///
/// Lists the issues under the epic, upserts a subtask per issue (existing
/// records keep their fields), mirrors `blocks` edges, then recomputes
/// initial statuses: a subtask with an unmerged dependency is
/// `blocked(dependency)`, otherwise `ready`. Subtasks already started
/// (`in_progress` and beyond, or `blocked(failure)`) are left alone.
pub async fn sync_task_from_tracker(
    pool: &PgPool,
    tracker: &dyn TrackerAdapter,
    hub: &EventHub,
    task_id: Uuid,
    repo_path: &Path,
    ctx: &CancellationToken,
) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
    let epic_id = task
        .epic_id
        .clone()
        .ok_or_else(|| CoreError::unprocessable(format!("task {task_id} has no epic yet")))?;
    let project = project_db::get_project(pool, task.project_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("project {}", task.project_id)))?;

    let issues = tracker
        .list_issues(repo_path, &epic_id, ctx)
        .await
        .map_err(|e| CoreError::ToolUnavailable(format!("tracker list failed: {e:#}")))?;

    // 1. Materialize subtasks.
    let mut by_issue_id: HashMap<String, Uuid> = HashMap::new();
    let mut ordered: Vec<(Uuid, Issue)> = Vec::new();

    for issue in issues {
        if issue.issue_type == IssueType::Epic {
            continue;
        }
        let parsed = parse_issue_body(&issue.description);
        let position = subtask_db::next_position(pool, task_id).await?;
        let subtask = subtask_db::upsert_subtask(
            pool,
            &subtask_db::NewSubtask {
                task_id,
                issue_id: issue.id.clone(),
                title: issue.title.clone(),
                spec: parsed.spec,
                plan: parsed.plan,
                position,
            },
        )
        .await?;
        by_issue_id.insert(issue.id.clone(), subtask.id);
        ordered.push((subtask.id, issue));
    }

    // 2. Mirror blocking edges.
    for (subtask_id, issue) in &ordered {
        for dep_issue_id in issue.dependency_ids() {
            match by_issue_id.get(dep_issue_id) {
                Some(dep_subtask_id) => {
                    subtask_db::insert_dependency(pool, *subtask_id, *dep_subtask_id).await?;
                }
                None => warn!(
                    issue = %issue.id,
                    depends_on = dep_issue_id,
                    "blocking edge references an issue outside the epic, skipping"
                ),
            }
        }
    }

    // 3. Recompute initial statuses.
    for (subtask_id, _) in &ordered {
        recompute_initial_status(pool, hub, project.id, task_id, *subtask_id).await?;
    }

    info!(%task_id, epic = %epic_id, subtasks = ordered.len(), "task synced from tracker");
    Ok(())
}

/// Recompute a subtask's pending/ready/blocked(dependency) status from its
/// dependency set, publishing a change event when it moved.
async fn recompute_initial_status(
    pool: &PgPool,
    hub: &EventHub,
    project_id: Uuid,
    task_id: Uuid,
    subtask_id: Uuid,
) -> Result<()> {
    let subtask = subtask_db::get_subtask(pool, subtask_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;

    // Only unstarted subtasks are recomputed; active and finished work
    // stays under the supervisor's control.
    let recomputable = matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready)
        || (subtask.status == SubtaskStatus::Blocked
            && subtask.blocked_reason == Some(BlockedReason::Dependency));
    if !recomputable {
        return Ok(());
    }

    let deps = subtask_db::blocking_dependencies(pool, subtask_id).await?;
    let blocked = deps.iter().any(|d| d.status != SubtaskStatus::Merged);

    let (status, reason) = if blocked {
        (SubtaskStatus::Blocked, Some(BlockedReason::Dependency))
    } else {
        (SubtaskStatus::Ready, None)
    };

    if subtask.status == status && subtask.blocked_reason == reason {
        return Ok(());
    }

    let prior = subtask_db::set_subtask_status(pool, subtask_id, status, reason)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;

    hub.publish(
        project_id,
        &Event::SubtaskStatusChanged {
            subtask_id,
            task_id,
            old_status: prior,
            new_status: status,
            blocked_reason: reason,
        },
    );
    Ok(())
}

/// Fetch a subtask's current tracker issue. Advisory: state transitions
/// remain under the supervisor's control.
pub async fn sync_subtask_from_tracker(
    pool: &PgPool,
    tracker: &dyn TrackerAdapter,
    subtask_id: Uuid,
    repo_path: &Path,
    ctx: &CancellationToken,
) -> Result<Issue> {
    let subtask = subtask_db::get_subtask(pool, subtask_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;

    tracker
        .show_issue(repo_path, &subtask.issue_id, ctx)
        .await
        .map_err(|e| CoreError::ToolUnavailable(format!("tracker show failed: {e:#}")))
}

/// After a subtask reaches `merged`, move any dependent whose dependencies
/// are now all merged from `blocked(dependency)` to `ready`, publishing
/// `subtask:unblocked` exactly once per transition.
pub async fn propagate_unblocks(
    pool: &PgPool,
    hub: &EventHub,
    project_id: Uuid,
    merged_subtask_id: Uuid,
) -> Result<Vec<Uuid>> {
    let mut unblocked = Vec::new();

    for dependent in subtask_db::dependents(pool, merged_subtask_id).await? {
        if dependent.status != SubtaskStatus::Blocked
            || dependent.blocked_reason != Some(BlockedReason::Dependency)
        {
            continue;
        }

        let deps = subtask_db::blocking_dependencies(pool, dependent.id).await?;
        if deps.iter().any(|d| d.status != SubtaskStatus::Merged) {
            continue;
        }

        // Optimistic lock: a concurrent propagation for the same dependent
        // loses here and publishes nothing.
        match dispatch::unblock_subtask(pool, dependent.id).await {
            Ok(()) => {
                hub.publish(
                    project_id,
                    &Event::SubtaskStatusChanged {
                        subtask_id: dependent.id,
                        task_id: dependent.task_id,
                        old_status: SubtaskStatus::Blocked,
                        new_status: SubtaskStatus::Ready,
                        blocked_reason: None,
                    },
                );
                hub.publish(
                    project_id,
                    &Event::SubtaskUnblocked {
                        subtask_id: dependent.id,
                        unblocked_by: merged_subtask_id,
                    },
                );
                unblocked.push(dependent.id);
            }
            Err(CoreError::Conflict(_)) => {
                debug!(subtask_id = %dependent.id, "lost unblock race, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(unblocked)
}

/// Background worker: periodically scan `in_progress` subtasks and catch
/// completions the supervisor missed (e.g. after a crash).
pub async fn sync_worker(
    pool: PgPool,
    tracker: Arc<dyn TrackerAdapter>,
    hub: Arc<EventHub>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => {
                info!("sync worker shutting down");
                return;
            }
        }

        if let Err(e) = sync_tick(&pool, tracker.as_ref(), &hub, &cancel).await {
            warn!(error = %e, "sync worker tick failed");
        }
    }
}

async fn sync_tick(
    pool: &PgPool,
    tracker: &dyn TrackerAdapter,
    hub: &EventHub,
    cancel: &CancellationToken,
) -> Result<()> {
    let in_progress = subtask_db::list_in_progress(pool).await?;

    for subtask in in_progress {
        let Some(task) = task_db::get_task(pool, subtask.task_id).await? else {
            continue;
        };
        let Some(project) = project_db::get_project(pool, task.project_id).await? else {
            continue;
        };

        let issue = match tracker
            .show_issue(Path::new(&project.clone_path), &subtask.issue_id, cancel)
            .await
        {
            Ok(issue) => issue,
            Err(e) => {
                debug!(subtask_id = %subtask.id, error = %e, "sync tick could not fetch issue");
                continue;
            }
        };

        if !issue.is_closed() {
            continue;
        }

        // Missed completion: the issue closed but the supervisor never saw
        // it. A live supervisor completing concurrently wins the optimistic
        // lock; losing here is fine.
        match dispatch::complete_subtask(pool, subtask.id).await {
            Ok(()) => {
                info!(subtask_id = %subtask.id, issue = %subtask.issue_id, "caught missed completion");
                hub.publish(
                    project.id,
                    &Event::SubtaskStatusChanged {
                        subtask_id: subtask.id,
                        task_id: subtask.task_id,
                        old_status: SubtaskStatus::InProgress,
                        new_status: SubtaskStatus::Completed,
                        blocked_reason: None,
                    },
                );
            }
            Err(CoreError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
