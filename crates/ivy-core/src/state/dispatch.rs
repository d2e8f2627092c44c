//! Convenience dispatch helpers that wrap the state machines' transitions
//! with semantic names.

use sqlx::PgPool;
use uuid::Uuid;

use ivy_db::models::{BlockedReason, SubtaskStatus, TaskStatus};

use super::{SubtaskStateMachine, TaskStateMachine};
use crate::error::Result;

/// Planner succeeded and subtasks are synced: `planning -> active`.
pub async fn activate_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Planning, TaskStatus::Active).await
}

/// Planner exhausted its budget: `planning -> planning_failed`.
pub async fn fail_planning(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Planning,
        TaskStatus::PlanningFailed,
    )
    .await
}

/// User retries planning: `planning_failed -> planning`.
pub async fn retry_planning(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::PlanningFailed,
        TaskStatus::Planning,
    )
    .await
}

/// Every subtask reached `merged`: `active -> done`.
pub async fn finish_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Active, TaskStatus::Done).await
}

/// User starts a ready subtask: `ready -> in_progress`.
pub async fn start_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    SubtaskStateMachine::transition(
        pool,
        subtask_id,
        SubtaskStatus::Ready,
        None,
        SubtaskStatus::InProgress,
        None,
    )
    .await
}

/// User retries a failed subtask: `blocked(failure) -> in_progress`.
pub async fn retry_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    SubtaskStateMachine::transition(
        pool,
        subtask_id,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Failure),
        SubtaskStatus::InProgress,
        None,
    )
    .await
}

/// Supervisor saw the tracker issue closed: `in_progress -> completed`.
pub async fn complete_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    SubtaskStateMachine::transition(
        pool,
        subtask_id,
        SubtaskStatus::InProgress,
        None,
        SubtaskStatus::Completed,
        None,
    )
    .await
}

/// Supervisor exhausted retries: `in_progress -> blocked(failure)`.
pub async fn block_subtask_failure(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    SubtaskStateMachine::transition(
        pool,
        subtask_id,
        SubtaskStatus::InProgress,
        None,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Failure),
    )
    .await
}

/// The last blocking dependency reached `merged`:
/// `blocked(dependency) -> ready`.
pub async fn unblock_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    SubtaskStateMachine::transition(
        pool,
        subtask_id,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Dependency),
        SubtaskStatus::Ready,
        None,
    )
    .await
}

/// User confirmed the pull request merged: `completed -> merged`.
pub async fn mark_merged(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    SubtaskStateMachine::transition(
        pool,
        subtask_id,
        SubtaskStatus::Completed,
        None,
        SubtaskStatus::Merged,
        None,
    )
    .await
}
