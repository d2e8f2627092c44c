use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task (a user submission that the planner decomposes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    PlanningFailed,
    Active,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::PlanningFailed => "planning_failed",
            Self::Active => "active",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "planning_failed" => Ok(Self::PlanningFailed),
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a subtask (a planner-produced work unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Ready,
    Blocked,
    InProgress,
    Completed,
    Merged,
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Merged => "merged",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = SubtaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "blocked" => Ok(Self::Blocked),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "merged" => Ok(Self::Merged),
            other => Err(SubtaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SubtaskStatusParseError(pub String);

impl fmt::Display for SubtaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask status: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Why a subtask is in `blocked` status.
///
/// Non-null exactly when the subtask status is [`SubtaskStatus::Blocked`];
/// the schema enforces the coupling with a CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    Dependency,
    Failure,
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dependency => "dependency",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

impl FromStr for BlockedReason {
    type Err = BlockedReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dependency" => Ok(Self::Dependency),
            "failure" => Ok(Self::Failure),
            other => Err(BlockedReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BlockedReason`] string.
#[derive(Debug, Clone)]
pub struct BlockedReasonParseError(pub String);

impl fmt::Display for BlockedReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid blocked reason: {:?}", self.0)
    }
}

impl std::error::Error for BlockedReasonParseError {}

// ---------------------------------------------------------------------------

/// Kind of agent driven by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planner,
    Worker,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = AgentKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(Self::Planner),
            "worker" => Ok(Self::Worker),
            other => Err(AgentKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentKind`] string.
#[derive(Debug, Clone)]
pub struct AgentKindParseError(pub String);

impl fmt::Display for AgentKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent kind: {:?}", self.0)
    }
}

impl std::error::Error for AgentKindParseError {}

// ---------------------------------------------------------------------------

/// Status of a single agent-run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered source-repository checkout.
///
/// Immutable after creation except for metadata updates. When `is_fork` is
/// true, `upstream_owner` and `upstream_repo` are both set (schema CHECK).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
    pub clone_path: String,
    pub tracker_prefix: String,
    pub is_fork: bool,
    pub upstream_owner: Option<String>,
    pub upstream_repo: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// The remote the clone is reset against: `upstream` for forks,
    /// `origin` otherwise.
    pub fn sync_remote(&self) -> &str {
        if self.is_fork { "upstream" } else { "origin" }
    }
}

/// A user submission, decomposed into subtasks by a planner run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Tracker epic identifier, set after a successful planner run.
    pub epic_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A planner-produced work unit, mirrored from a tracker issue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub title: String,
    pub spec: String,
    pub plan: String,
    pub status: SubtaskStatus,
    pub blocked_reason: Option<BlockedReason>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i32>,
    /// Consumed worker attempts; incremented before each attempt.
    pub retry_count: i32,
    pub tokens_used: i64,
    /// User-controlled ordering within a column.
    pub position: i32,
    /// Tracker issue identifier, e.g. `iv-12`.
    pub issue_id: String,
    pub worktree_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed dependency edge: `subtask_id` depends on `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubtaskDependency {
    pub subtask_id: Uuid,
    pub depends_on: Uuid,
}

/// One child-process agent attempt.
///
/// Exactly one of `task_id` (planner) and `subtask_id` (worker) is set,
/// matching `kind`; the schema enforces both with CHECK constraints. A run
/// transitions `running -> succeeded` or `running -> failed` exactly once
/// and never mutates again.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRun {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub subtask_id: Option<Uuid>,
    pub kind: AgentKind,
    pub attempt: i32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tokens_used: i64,
    pub error: Option<String>,
    pub log_path: String,
    pub prompt: String,
}

impl AgentRun {
    /// The task or subtask this run belongs to.
    pub fn parent_id(&self) -> Uuid {
        match self.kind {
            AgentKind::Planner => self.task_id.expect("planner run has task_id"),
            AgentKind::Worker => self.subtask_id.expect("worker run has subtask_id"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Planning,
            TaskStatus::PlanningFailed,
            TaskStatus::Active,
            TaskStatus::Done,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn subtask_status_display_roundtrip() {
        let variants = [
            SubtaskStatus::Pending,
            SubtaskStatus::Ready,
            SubtaskStatus::Blocked,
            SubtaskStatus::InProgress,
            SubtaskStatus::Completed,
            SubtaskStatus::Merged,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SubtaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn subtask_status_invalid() {
        let result = "nope".parse::<SubtaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn blocked_reason_display_roundtrip() {
        let variants = [BlockedReason::Dependency, BlockedReason::Failure];
        for v in &variants {
            let s = v.to_string();
            let parsed: BlockedReason = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_kind_display_roundtrip() {
        let variants = [AgentKind::Planner, AgentKind::Worker];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_display_roundtrip() {
        let variants = [RunStatus::Running, RunStatus::Succeeded, RunStatus::Failed];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_invalid() {
        let result = "crashed".parse::<RunStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn project_sync_remote() {
        let mk = |is_fork| Project {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            owner: "octocat".into(),
            repo: "hello".into(),
            default_branch: "main".into(),
            clone_path: "/data/projects/u/octocat/hello".into(),
            tracker_prefix: "iv".into(),
            is_fork,
            upstream_owner: is_fork.then(|| "upstream".to_string()),
            upstream_repo: is_fork.then(|| "hello".to_string()),
            created_at: Utc::now(),
        };
        assert_eq!(mk(false).sync_remote(), "origin");
        assert_eq!(mk(true).sync_remote(), "upstream");
    }
}
