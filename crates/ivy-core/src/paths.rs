//! The persistent-state layout under the data directory.
//!
//! ```text
//! <data>/projects/<user-id>/<owner>/<repo>                  main clone
//! <data>/projects/<user-id>/<owner>/<repo>/<subtask-id>     working trees
//! <data>/prompts/<project-id>/<task-id>/planner.md          planner prompt
//! <data>/prompts/<project-id>/<task-id>/<subtask-id>.md     worker prompt
//! <data>/logs/<project-id>/<task-id>[/<subtask-id>]/run-NNN.log
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Path of a project's main clone.
pub fn project_clone_dir(data_dir: &Path, user_id: Uuid, owner: &str, repo: &str) -> PathBuf {
    data_dir
        .join("projects")
        .join(user_id.to_string())
        .join(owner)
        .join(repo)
}

/// Path of a subtask's working tree, inside the project clone. The tracker
/// adapter's worktree subcommand creates it, named for the subtask.
pub fn worktree_dir(clone_path: &Path, subtask_id: Uuid) -> PathBuf {
    clone_path.join(subtask_id.to_string())
}

/// Path of the rendered planner prompt for a task.
pub fn planner_prompt_path(data_dir: &Path, project_id: Uuid, task_id: Uuid) -> PathBuf {
    data_dir
        .join("prompts")
        .join(project_id.to_string())
        .join(task_id.to_string())
        .join("planner.md")
}

/// Path of the rendered worker prompt for a subtask.
pub fn worker_prompt_path(
    data_dir: &Path,
    project_id: Uuid,
    task_id: Uuid,
    subtask_id: Uuid,
) -> PathBuf {
    data_dir
        .join("prompts")
        .join(project_id.to_string())
        .join(task_id.to_string())
        .join(format!("{subtask_id}.md"))
}

/// Log path for a planner attempt. Attempts start at 1 and are zero-padded
/// to three digits.
pub fn planner_log_path(
    data_dir: &Path,
    project_id: Uuid,
    task_id: Uuid,
    attempt: i32,
) -> PathBuf {
    data_dir
        .join("logs")
        .join(project_id.to_string())
        .join(task_id.to_string())
        .join(format!("run-{attempt:03}.log"))
}

/// Log path for a worker attempt.
pub fn worker_log_path(
    data_dir: &Path,
    project_id: Uuid,
    task_id: Uuid,
    subtask_id: Uuid,
    attempt: i32,
) -> PathBuf {
    data_dir
        .join("logs")
        .join(project_id.to_string())
        .join(task_id.to_string())
        .join(subtask_id.to_string())
        .join(format!("run-{attempt:03}.log"))
}
