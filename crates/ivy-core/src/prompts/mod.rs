//! Prompt renderer: pure template expansion over task/subtask/project
//! context, persisted for audit.

use std::path::Path;

use anyhow::{Context, Result};

use ivy_db::models::{Project, Subtask, Task};

use crate::naming::short_tag;

const PLANNER_TEMPLATE: &str = include_str!("templates/planner.md");
const WORKER_TEMPLATE: &str = include_str!("templates/worker.md");

/// Name of the tracker binary, substituted into prompt instructions.
const TRACKER_BINARY: &str = "trk";

/// Expand `{placeholder}` markers against a substitution table.
fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Render the planner instruction document for a task.
pub fn render_planner(task: &Task, project: &Project) -> String {
    let tag = short_tag(task.id);
    render(
        PLANNER_TEMPLATE,
        &[
            ("task_title", task.title.as_str()),
            ("task_description", task.description.as_str()),
            ("task_tag", tag.as_str()),
            ("tracker", TRACKER_BINARY),
            ("default_branch", project.default_branch.as_str()),
        ],
    )
}

/// Render the worker instruction document for a subtask.
pub fn render_worker(subtask: &Subtask, project: &Project) -> String {
    let branch = subtask.branch_name.clone().unwrap_or_default();
    let plan = if subtask.plan.is_empty() {
        "Use your judgement; the spec is the contract."
    } else {
        subtask.plan.as_str()
    };
    render(
        WORKER_TEMPLATE,
        &[
            ("subtask_title", subtask.title.as_str()),
            ("issue_id", subtask.issue_id.as_str()),
            ("branch_name", branch.as_str()),
            ("spec", subtask.spec.as_str()),
            ("plan", plan),
            ("tracker", TRACKER_BINARY),
            ("default_branch", project.default_branch.as_str()),
        ],
    )
}

/// Write a rendered prompt to its audit location, creating parent
/// directories as needed.
pub fn persist(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create prompt directory {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write prompt to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ivy_db::models::{SubtaskStatus, TaskStatus};
    use uuid::Uuid;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            owner: "octocat".into(),
            repo: "hello".into(),
            default_branch: "main".into(),
            clone_path: "/data/projects/u/octocat/hello".into(),
            tracker_prefix: "iv".into(),
            is_fork: false,
            upstream_owner: None,
            upstream_repo: None,
            created_at: Utc::now(),
        }
    }

    fn task() -> Task {
        Task {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            title: "Add OAuth".into(),
            description: "Support login via OAuth.".into(),
            status: TaskStatus::Planning,
            epic_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn subtask() -> Subtask {
        Subtask {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            title: "Add OAuth Handler".into(),
            spec: "The handler must exchange the code for a token.".into(),
            plan: "Touch src/auth.rs.".into(),
            status: SubtaskStatus::Ready,
            blocked_reason: None,
            branch_name: Some("iv-5-add-oauth-handler".into()),
            pr_url: None,
            pr_number: None,
            retry_count: 0,
            tokens_used: 0,
            position: 1,
            issue_id: "iv-5".into(),
            worktree_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn planner_prompt_carries_tag_and_close_contract() {
        let task = task();
        let rendered = render_planner(&task, &project());
        let tag = short_tag(task.id);

        assert!(rendered.contains(&format!("[IV-{tag}]")));
        assert!(rendered.contains("Add OAuth"));
        // The epic-close contract is what find_epic_by_task_id relies on.
        assert!(rendered.contains("close the epic"));
        assert!(!rendered.contains('{'), "unexpanded placeholder left behind");
    }

    #[test]
    fn worker_prompt_carries_spec_plan_and_issue() {
        let rendered = render_worker(&subtask(), &project());
        assert!(rendered.contains("iv-5"));
        assert!(rendered.contains("exchange the code for a token"));
        assert!(rendered.contains("Touch src/auth.rs."));
        assert!(rendered.contains("iv-5-add-oauth-handler"));
        assert!(!rendered.contains('{'), "unexpanded placeholder left behind");
    }

    #[test]
    fn worker_prompt_defaults_empty_plan() {
        let mut subtask = subtask();
        subtask.plan = String::new();
        let rendered = render_worker(&subtask, &project());
        assert!(rendered.contains("the spec is the contract"));
    }

    #[test]
    fn persist_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/c/planner.md");
        persist(&path, "content").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "content");
    }
}
