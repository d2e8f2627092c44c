//! Database query functions for the `subtasks` and `subtask_dependencies`
//! tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BlockedReason, Subtask, SubtaskStatus};

/// Parameters for materializing a subtask from a tracker issue.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub task_id: Uuid,
    pub issue_id: String,
    pub title: String,
    pub spec: String,
    pub plan: String,
    pub position: i32,
}

/// Insert a subtask mirrored from a tracker issue, keyed by
/// `(task_id, issue_id)`.
///
/// The tracker is the source of truth for issue content, but an existing
/// local record is never overwritten: on conflict the insert is a no-op and
/// the existing row is returned. Status recomputation happens separately.
pub async fn upsert_subtask(pool: &PgPool, new: &NewSubtask) -> Result<Subtask> {
    // ON CONFLICT DO NOTHING returns no row, so fall back to a fetch.
    let inserted = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks (task_id, issue_id, title, spec, plan, position) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (task_id, issue_id) DO NOTHING \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.issue_id)
    .bind(&new.title)
    .bind(&new.spec)
    .bind(&new.plan)
    .bind(new.position)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to upsert subtask for issue {}", new.issue_id))?;

    if let Some(subtask) = inserted {
        return Ok(subtask);
    }

    let existing = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 AND issue_id = $2",
    )
    .bind(new.task_id)
    .bind(&new.issue_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to fetch existing subtask for issue {}", new.issue_id))?;

    Ok(existing)
}

/// Fetch a single subtask by ID.
pub async fn get_subtask(pool: &PgPool, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// List all subtasks for a task, in user-controlled column order.
pub async fn list_subtasks_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 ORDER BY position ASC, created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks for task")?;

    Ok(subtasks)
}

/// List all subtasks currently in `in_progress`, across every task.
///
/// Scanned by the background sync worker to catch missed completions.
pub async fn list_in_progress(pool: &PgPool) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE status = 'in_progress' ORDER BY updated_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list in-progress subtasks")?;

    Ok(subtasks)
}

/// Atomically transition a subtask from one status to another, setting the
/// blocked reason in the same statement.
///
/// Optimistic locking: the row is only updated when the current status
/// matches `from`. Returns rows affected (0 = status mismatch or missing
/// row). The caller is responsible for keeping `blocked_reason` coupled to
/// the `blocked` status; the schema CHECK rejects violations.
pub async fn transition_subtask_status(
    pool: &PgPool,
    subtask_id: Uuid,
    from: SubtaskStatus,
    to: SubtaskStatus,
    blocked_reason: Option<BlockedReason>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = $1, blocked_reason = $2, updated_at = NOW() \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(blocked_reason)
    .bind(subtask_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition subtask status")?;

    Ok(result.rows_affected())
}

/// Set a subtask's status unconditionally, returning the prior status.
///
/// Used by the sync reconciler when recomputing initial statuses, where
/// the caller needs the old value to decide whether to publish a change
/// event. Returns `None` when the subtask does not exist.
pub async fn set_subtask_status(
    pool: &PgPool,
    subtask_id: Uuid,
    to: SubtaskStatus,
    blocked_reason: Option<BlockedReason>,
) -> Result<Option<SubtaskStatus>> {
    let prior: Option<(SubtaskStatus,)> = sqlx::query_as(
        "WITH prev AS (SELECT id, status FROM subtasks WHERE id = $3 FOR UPDATE) \
         UPDATE subtasks s \
         SET status = $1, blocked_reason = $2, updated_at = NOW() \
         FROM prev WHERE s.id = prev.id \
         RETURNING prev.status",
    )
    .bind(to)
    .bind(blocked_reason)
    .bind(subtask_id)
    .fetch_optional(pool)
    .await
    .context("failed to set subtask status")?;

    Ok(prior.map(|(status,)| status))
}

/// Increment the consumed-attempt counter. Returns the new value.
pub async fn increment_retry_count(pool: &PgPool, subtask_id: Uuid) -> Result<i32> {
    let (count,): (i32,) = sqlx::query_as(
        "UPDATE subtasks SET retry_count = retry_count + 1, updated_at = NOW() \
         WHERE id = $1 \
         RETURNING retry_count",
    )
    .bind(subtask_id)
    .fetch_one(pool)
    .await
    .context("failed to increment subtask retry count")?;

    Ok(count)
}

/// Add token usage from a finished agent run to the subtask's running total.
pub async fn add_tokens_used(pool: &PgPool, subtask_id: Uuid, tokens: i64) -> Result<()> {
    sqlx::query(
        "UPDATE subtasks SET tokens_used = tokens_used + $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(tokens)
    .bind(subtask_id)
    .execute(pool)
    .await
    .context("failed to add subtask token usage")?;

    Ok(())
}

/// Record the branch and working-tree path assigned when work starts.
pub async fn set_workspace(
    pool: &PgPool,
    subtask_id: Uuid,
    branch_name: &str,
    worktree_path: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET branch_name = $1, worktree_path = $2, updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(branch_name)
    .bind(worktree_path)
    .bind(subtask_id)
    .execute(pool)
    .await
    .context("failed to set subtask workspace")?;

    Ok(result.rows_affected())
}

/// Record the pull request opened for a completed subtask.
pub async fn set_pull_request(
    pool: &PgPool,
    subtask_id: Uuid,
    pr_url: &str,
    pr_number: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET pr_url = $1, pr_number = $2, updated_at = NOW() WHERE id = $3",
    )
    .bind(pr_url)
    .bind(pr_number)
    .bind(subtask_id)
    .execute(pool)
    .await
    .context("failed to set subtask pull request")?;

    Ok(result.rows_affected())
}

/// Next free position at the bottom of a task's column.
///
/// Positions are monotonically assigned; reorders write absolute values.
pub async fn next_position(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let (max,): (Option<i32>,) =
        sqlx::query_as("SELECT MAX(position) FROM subtasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to compute next subtask position")?;

    Ok(max.unwrap_or(0) + 1)
}

/// Write an absolute position (user-controlled reorder).
pub async fn set_position(pool: &PgPool, subtask_id: Uuid, position: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET position = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(position)
    .bind(subtask_id)
    .execute(pool)
    .await
    .context("failed to set subtask position")?;

    Ok(result.rows_affected())
}

/// Delete a subtask. Dependency edges cascade via the schema.
pub async fn delete_subtask(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM subtasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete subtask")?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Dependency edges
// ---------------------------------------------------------------------------

/// Insert a dependency edge: `subtask_id` depends on `depends_on`.
///
/// Uses `ON CONFLICT DO NOTHING` so mirroring from the tracker is
/// idempotent.
pub async fn insert_dependency(pool: &PgPool, subtask_id: Uuid, depends_on: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO subtask_dependencies (subtask_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(subtask_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert subtask dependency")?;

    Ok(())
}

/// The full set of subtasks that block the given subtask, in one round-trip.
pub async fn blocking_dependencies(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<Subtask>> {
    let deps = sqlx::query_as::<_, Subtask>(
        "SELECT dep.* FROM subtask_dependencies sd \
         JOIN subtasks dep ON dep.id = sd.depends_on \
         WHERE sd.subtask_id = $1 \
         ORDER BY dep.position ASC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch blocking dependencies")?;

    Ok(deps)
}

/// The subtasks that depend on the given subtask, in one round-trip.
pub async fn dependents(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<Subtask>> {
    let deps = sqlx::query_as::<_, Subtask>(
        "SELECT s.* FROM subtask_dependencies sd \
         JOIN subtasks s ON s.id = sd.subtask_id \
         WHERE sd.depends_on = $1 \
         ORDER BY s.position ASC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch dependents")?;

    Ok(deps)
}
