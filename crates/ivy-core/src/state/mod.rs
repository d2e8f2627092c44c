//! Task and subtask state machines.
//!
//! Validates and executes state transitions, enforcing the allowed
//! transition graphs and optimistic locking. Events are published by the
//! caller only after the durable mutation commits.

pub mod dispatch;

use sqlx::PgPool;
use uuid::Uuid;

use ivy_db::models::{BlockedReason, SubtaskStatus, TaskStatus};
use ivy_db::queries::subtasks as subtask_db;
use ivy_db::queries::tasks as task_db;

use crate::error::{CoreError, Result};

/// The task state machine.
///
/// ```text
/// planning        -> active           (planner succeeds, subtasks synced)
/// planning        -> planning_failed  (planner exceeds retry budget)
/// planning_failed -> planning         (user retries)
/// active          -> done             (all subtasks merged)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the task state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Planning, TaskStatus::Active)
                | (TaskStatus::Planning, TaskStatus::PlanningFailed)
                | (TaskStatus::PlanningFailed, TaskStatus::Planning)
                | (TaskStatus::Active, TaskStatus::Done)
        )
    }

    /// Execute a transition with optimistic locking.
    ///
    /// Returns `InvalidTransition` for edges outside the graph, `NotFound`
    /// when the task does not exist, and `Conflict` when the stored status
    /// no longer matches `from` (another writer won).
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(CoreError::invalid_transition(from, to));
        }

        let rows = task_db::transition_task_status(pool, task_id, from, to).await?;

        if rows == 0 {
            let task = task_db::get_task(pool, task_id).await?;
            return match task {
                None => Err(CoreError::not_found(format!("task {task_id}"))),
                Some(t) => Err(CoreError::conflict(format!(
                    "task {task_id} has status {}, expected {from}",
                    t.status
                ))),
            };
        }

        Ok(())
    }
}

/// The subtask state machine.
///
/// ```text
/// pending             -> ready                (no blocking deps at sync)
/// pending             -> blocked(dependency)  (blocking deps present)
/// blocked(dependency) -> ready                (last dependency merged)
/// ready               -> in_progress          (user starts)
/// blocked(failure)    -> in_progress          (user retries)
/// in_progress         -> completed            (tracker issue closed)
/// in_progress         -> blocked(failure)     (retries exhausted)
/// completed           -> merged               (user confirms PR merged)
/// ```
pub struct SubtaskStateMachine;

impl SubtaskStateMachine {
    /// Check whether a transition is a valid edge in the subtask state
    /// graph. The blocked states are distinguished by reason.
    pub fn is_valid_transition(
        from: SubtaskStatus,
        from_reason: Option<BlockedReason>,
        to: SubtaskStatus,
        to_reason: Option<BlockedReason>,
    ) -> bool {
        use BlockedReason::{Dependency, Failure};
        use SubtaskStatus::*;

        match (from, from_reason, to, to_reason) {
            (Pending, None, Ready, None) => true,
            (Pending, None, Blocked, Some(Dependency)) => true,
            (Blocked, Some(Dependency), Ready, None) => true,
            (Ready, None, InProgress, None) => true,
            (Blocked, Some(Failure), InProgress, None) => true,
            (InProgress, None, Completed, None) => true,
            (InProgress, None, Blocked, Some(Failure)) => true,
            (Completed, None, Merged, None) => true,
            _ => false,
        }
    }

    /// Execute a transition with optimistic locking.
    ///
    /// The blocked-reason coupling is part of the edge: a transition into
    /// `blocked` carries its reason, every other target clears it.
    pub async fn transition(
        pool: &PgPool,
        subtask_id: Uuid,
        from: SubtaskStatus,
        from_reason: Option<BlockedReason>,
        to: SubtaskStatus,
        to_reason: Option<BlockedReason>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, from_reason, to, to_reason) {
            return Err(CoreError::invalid_transition(
                describe(from, from_reason),
                describe(to, to_reason),
            ));
        }

        let rows =
            subtask_db::transition_subtask_status(pool, subtask_id, from, to, to_reason).await?;

        if rows == 0 {
            let subtask = subtask_db::get_subtask(pool, subtask_id).await?;
            return match subtask {
                None => Err(CoreError::not_found(format!("subtask {subtask_id}"))),
                Some(s) => Err(CoreError::conflict(format!(
                    "subtask {subtask_id} has status {}, expected {from}",
                    s.status
                ))),
            };
        }

        Ok(())
    }
}

/// Human-readable status with its blocked reason, for error messages.
fn describe(status: SubtaskStatus, reason: Option<BlockedReason>) -> String {
    match reason {
        Some(reason) => format!("{status}({reason})"),
        None => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BlockedReason::{Dependency, Failure};
    use SubtaskStatus::*;

    #[test]
    fn task_graph_accepts_listed_edges() {
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Planning,
            TaskStatus::Active
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Planning,
            TaskStatus::PlanningFailed
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::PlanningFailed,
            TaskStatus::Planning
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Active,
            TaskStatus::Done
        ));
    }

    #[test]
    fn task_graph_rejects_everything_else() {
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Done,
            TaskStatus::Planning
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Planning,
            TaskStatus::Done
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Active,
            TaskStatus::Planning
        ));
    }

    #[test]
    fn subtask_graph_accepts_listed_edges() {
        let edges = [
            (Pending, None, Ready, None),
            (Pending, None, Blocked, Some(Dependency)),
            (Blocked, Some(Dependency), Ready, None),
            (Ready, None, InProgress, None),
            (Blocked, Some(Failure), InProgress, None),
            (InProgress, None, Completed, None),
            (InProgress, None, Blocked, Some(Failure)),
            (Completed, None, Merged, None),
        ];
        for (from, fr, to, tr) in edges {
            assert!(
                SubtaskStateMachine::is_valid_transition(from, fr, to, tr),
                "expected valid: {from:?}({fr:?}) -> {to:?}({tr:?})"
            );
        }
    }

    #[test]
    fn subtask_graph_distinguishes_blocked_reasons() {
        // Blocked-on-dependency cannot go straight to in_progress.
        assert!(!SubtaskStateMachine::is_valid_transition(
            Blocked,
            Some(Dependency),
            InProgress,
            None
        ));
        // Blocked-on-failure does not unblock to ready.
        assert!(!SubtaskStateMachine::is_valid_transition(
            Blocked,
            Some(Failure),
            Ready,
            None
        ));
    }

    #[test]
    fn subtask_graph_rejects_reason_on_non_blocked_target() {
        assert!(!SubtaskStateMachine::is_valid_transition(
            Pending,
            None,
            Ready,
            Some(Dependency)
        ));
        assert!(!SubtaskStateMachine::is_valid_transition(
            InProgress,
            None,
            Blocked,
            None
        ));
    }

    #[test]
    fn subtask_graph_rejects_skips() {
        assert!(!SubtaskStateMachine::is_valid_transition(
            Pending, None, Merged, None
        ));
        assert!(!SubtaskStateMachine::is_valid_transition(
            Ready, None, Completed, None
        ));
        assert!(!SubtaskStateMachine::is_valid_transition(
            Merged, None, InProgress, None
        ));
    }
}
