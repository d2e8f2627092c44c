//! Startup recovery: reconcile agent runs orphaned by a previous process
//! instance.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use ivy_db::models::{AgentKind, BlockedReason, RunStatus, SubtaskStatus};
use ivy_db::queries::agent_runs as run_db;
use ivy_db::queries::subtasks as subtask_db;
use ivy_db::queries::tasks as task_db;

use crate::error::{CoreError, Result};
use crate::events::{Event, EventHub};
use crate::manager::AgentSpawner;
use crate::state::dispatch;

/// Runs still marked `running` whose start time is older than this are
/// assumed orphaned.
pub const ORPHAN_CUTOFF: Duration = Duration::from_secs(5 * 60);

/// What recovery did, for the startup log.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Runs marked failed.
    pub orphaned_runs: usize,
    /// Subtasks whose worker was respawned.
    pub respawned: Vec<Uuid>,
    /// Subtasks moved to `blocked(failure)` because the budget was spent.
    pub blocked: Vec<Uuid>,
}

/// Reconcile orphaned runs and resume interrupted workers.
///
/// Planner runs are never resumed: planners are one-shot, the task stays
/// in `planning`, and the user retries. For each subtask the run with the
/// highest attempt number decides: budget spent moves the subtask to
/// `blocked(failure)`, otherwise a still-`in_progress` subtask gets a
/// fresh worker supervisor.
pub async fn recover(
    pool: &PgPool,
    hub: &EventHub,
    spawner: &dyn AgentSpawner,
    max_retries: i32,
) -> Result<RecoveryReport> {
    let cutoff = Utc::now() - chrono::Duration::from_std(ORPHAN_CUTOFF).expect("constant fits");
    let stale = run_db::list_stale_running(pool, cutoff).await?;

    let mut report = RecoveryReport::default();
    // Highest orphaned attempt per subtask.
    let mut worker_attempts: HashMap<Uuid, i32> = HashMap::new();

    for run in &stale {
        let rows = run_db::finish_run(
            pool,
            run.id,
            RunStatus::Failed,
            run.tokens_used,
            Some("orphaned by previous process instance"),
        )
        .await?;
        if rows == 0 {
            // Terminated between the scan and now; nothing to recover.
            continue;
        }
        report.orphaned_runs += 1;

        match run.kind {
            AgentKind::Planner => {
                info!(
                    run_id = %run.id,
                    task_id = ?run.task_id,
                    "orphaned planner marked failed; task stays in planning for user retry"
                );
            }
            AgentKind::Worker => {
                let subtask_id = run.subtask_id.expect("worker run has subtask_id");
                let entry = worker_attempts.entry(subtask_id).or_insert(run.attempt);
                *entry = (*entry).max(run.attempt);
            }
        }
    }

    for (subtask_id, attempt) in worker_attempts {
        let Some(subtask) = subtask_db::get_subtask(pool, subtask_id).await? else {
            continue;
        };

        if attempt >= max_retries {
            if subtask.status == SubtaskStatus::InProgress {
                dispatch::block_subtask_failure(pool, subtask_id).await?;
                if let Some(project_id) = project_of(pool, subtask.task_id).await? {
                    hub.publish(
                        project_id,
                        &Event::SubtaskStatusChanged {
                            subtask_id,
                            task_id: subtask.task_id,
                            old_status: SubtaskStatus::InProgress,
                            new_status: SubtaskStatus::Blocked,
                            blocked_reason: Some(BlockedReason::Failure),
                        },
                    );
                }
                report.blocked.push(subtask_id);
                info!(%subtask_id, attempt, "budget spent, subtask blocked on failure");
            }
            continue;
        }

        if subtask.status != SubtaskStatus::InProgress {
            continue;
        }

        match spawner.spawn_worker(subtask_id).await {
            Ok(()) => {
                report.respawned.push(subtask_id);
                info!(%subtask_id, attempt, "respawned worker after restart");
            }
            Err(CoreError::Conflict(_)) => {
                // Already respawned by another path.
            }
            Err(e) => {
                warn!(%subtask_id, error = %e, "failed to respawn worker");
            }
        }
    }

    info!(
        orphaned = report.orphaned_runs,
        respawned = report.respawned.len(),
        blocked = report.blocked.len(),
        "recovery complete"
    );
    Ok(report)
}

async fn project_of(pool: &PgPool, task_id: Uuid) -> Result<Option<Uuid>> {
    Ok(task_db::get_task(pool, task_id).await?.map(|t| t.project_id))
}
