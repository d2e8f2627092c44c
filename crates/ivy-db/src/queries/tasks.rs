//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row in `planning` status. Returns the inserted task
/// with server-generated defaults (id, timestamps).
pub async fn insert_task(
    pool: &PgPool,
    project_id: Uuid,
    title: &str,
    description: &str,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (project_id, title, description) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(title)
    .bind(description)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project, ordered by creation time.
pub async fn list_tasks_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = $1 ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Returns the number of rows affected (0 means the status did
/// not match or the task does not exist).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Record the tracker epic located after a successful planner run.
pub async fn set_task_epic(pool: &PgPool, task_id: Uuid, epic_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET epic_id = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(epic_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task epic")?;

    Ok(result.rows_affected())
}

/// Delete a task. Subtasks and agent runs cascade via the schema.
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected())
}

/// Check whether every subtask of a task is `merged`, and the task has at
/// least one subtask. Used for the `active -> done` transition.
pub async fn all_subtasks_merged(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let (total, unmerged): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE status != 'merged') \
         FROM subtasks WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check subtask completion")?;

    Ok(total > 0 && unmerged == 0)
}
