//! Database query functions for the `agent_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentKind, AgentRun, RunStatus};

/// Parameters for recording a new agent-run attempt.
///
/// Exactly one of `task_id` / `subtask_id` is set, matching `kind`; the
/// schema CHECK constraints reject anything else.
#[derive(Debug, Clone)]
pub struct NewAgentRun {
    pub task_id: Option<Uuid>,
    pub subtask_id: Option<Uuid>,
    pub kind: AgentKind,
    pub attempt: i32,
    pub log_path: String,
    pub prompt: String,
}

/// Insert a new agent run in `running` status. Returns the inserted row
/// with server-generated defaults (id, started_at).
pub async fn insert_run(pool: &PgPool, new: &NewAgentRun) -> Result<AgentRun> {
    let run = sqlx::query_as::<_, AgentRun>(
        "INSERT INTO agent_runs (task_id, subtask_id, kind, attempt, log_path, prompt) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.subtask_id)
    .bind(new.kind)
    .bind(new.attempt)
    .bind(&new.log_path)
    .bind(&new.prompt)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert {} run attempt {}", new.kind, new.attempt))?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>("SELECT * FROM agent_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent run")?;

    Ok(run)
}

/// Terminate a run exactly once: `running -> succeeded | failed`.
///
/// Optimistic locking on the `running` status makes termination
/// idempotent-safe; a second call affects zero rows. Returns rows
/// affected.
pub async fn finish_run(
    pool: &PgPool,
    run_id: Uuid,
    status: RunStatus,
    tokens_used: i64,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_runs \
         SET status = $1, ended_at = NOW(), tokens_used = $2, error = $3 \
         WHERE id = $4 AND status = 'running'",
    )
    .bind(status)
    .bind(tokens_used)
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to finish agent run")?;

    Ok(result.rows_affected())
}

/// List all runs for a subtask, newest attempt first.
pub async fn list_runs_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE subtask_id = $1 ORDER BY attempt DESC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for subtask")?;

    Ok(runs)
}

/// List all runs for a task (planner runs), newest attempt first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE task_id = $1 ORDER BY attempt DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for task")?;

    Ok(runs)
}

/// List run IDs still in `running` status for a project, for the SSE
/// `connected` greeting.
pub async fn list_active_run_ids_for_project(
    pool: &PgPool,
    project_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT r.id FROM agent_runs r \
         LEFT JOIN tasks t ON t.id = r.task_id \
         LEFT JOIN subtasks s ON s.id = r.subtask_id \
         LEFT JOIN tasks st ON st.id = s.task_id \
         WHERE r.status = 'running' \
           AND COALESCE(t.project_id, st.project_id) = $1",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list active runs for project")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// List runs in `running` status whose start time is older than the cutoff.
///
/// Used by startup recovery to find runs orphaned by a previous process
/// instance.
pub async fn list_stale_running(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs \
         WHERE status = 'running' AND started_at < $1 \
         ORDER BY started_at ASC",
    )
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to list stale running agent runs")?;

    Ok(runs)
}
