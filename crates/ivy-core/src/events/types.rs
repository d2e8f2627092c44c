//! Event categories fanned out to subscribers.

use serde::Serialize;
use uuid::Uuid;

use ivy_db::models::{AgentKind, BlockedReason, SubtaskStatus, TaskStatus};

/// A lifecycle or log event scoped to one project.
///
/// `kind()` is the wire-level event name (the SSE `event:` field); the
/// variant fields serialize as the JSON payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    AgentStarted {
        run_id: Uuid,
        kind: AgentKind,
        task_id: Option<Uuid>,
        subtask_id: Option<Uuid>,
        attempt: i32,
    },
    AgentLog {
        run_id: Uuid,
        line: String,
        /// Leading `[HH:MM:SS]` stamp extracted from the line, if present.
        timestamp: Option<String>,
    },
    AgentCompleted {
        run_id: Uuid,
        task_id: Option<Uuid>,
        subtask_id: Option<Uuid>,
        pr_url: Option<String>,
        tokens_used: i64,
    },
    AgentFailed {
        run_id: Uuid,
        task_id: Option<Uuid>,
        subtask_id: Option<Uuid>,
        error: String,
        will_retry: bool,
    },
    TaskStatusChanged {
        task_id: Uuid,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    SubtaskStatusChanged {
        subtask_id: Uuid,
        task_id: Uuid,
        old_status: SubtaskStatus,
        new_status: SubtaskStatus,
        blocked_reason: Option<BlockedReason>,
    },
    SubtaskUnblocked {
        subtask_id: Uuid,
        unblocked_by: Uuid,
    },
    Connected {
        connection_id: Uuid,
        active_runs: Vec<Uuid>,
    },
    Heartbeat {},
    Error {
        message: String,
    },
}

impl Event {
    /// Wire-level event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStarted { .. } => "agent:started",
            Self::AgentLog { .. } => "agent:log",
            Self::AgentCompleted { .. } => "agent:completed",
            Self::AgentFailed { .. } => "agent:failed",
            Self::TaskStatusChanged { .. } => "task:status_changed",
            Self::SubtaskStatusChanged { .. } => "subtask:status_changed",
            Self::SubtaskUnblocked { .. } => "subtask:unblocked",
            Self::Connected { .. } => "connected",
            Self::Heartbeat {} => "heartbeat",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_wire_protocol() {
        let run_id = Uuid::new_v4();
        let event = Event::AgentLog {
            run_id,
            line: "hello".into(),
            timestamp: None,
        };
        assert_eq!(event.kind(), "agent:log");
        assert_eq!(Event::Heartbeat {}.kind(), "heartbeat");
    }

    #[test]
    fn payload_serializes_flat() {
        let subtask_id = Uuid::new_v4();
        let unblocked_by = Uuid::new_v4();
        let event = Event::SubtaskUnblocked {
            subtask_id,
            unblocked_by,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["unblocked_by"], unblocked_by.to_string());
        assert_eq!(value["subtask_id"], subtask_id.to_string());
    }

    #[test]
    fn status_change_payload_uses_snake_case() {
        let event = Event::TaskStatusChanged {
            task_id: Uuid::new_v4(),
            old_status: TaskStatus::Planning,
            new_status: TaskStatus::PlanningFailed,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["new_status"], "planning_failed");
    }
}
