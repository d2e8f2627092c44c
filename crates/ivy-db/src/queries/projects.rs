//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Project;

/// Parameters for registering a new project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub user_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
    pub clone_path: String,
    pub tracker_prefix: String,
    pub is_fork: bool,
    pub upstream_owner: Option<String>,
    pub upstream_repo: Option<String>,
}

/// Insert a new project row. Returns the inserted project with
/// server-generated defaults (id, created_at).
pub async fn insert_project(pool: &PgPool, new: &NewProject) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (user_id, owner, repo, default_branch, clone_path, \
                               tracker_prefix, is_fork, upstream_owner, upstream_repo) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.user_id)
    .bind(&new.owner)
    .bind(&new.repo)
    .bind(&new.default_branch)
    .bind(&new.clone_path)
    .bind(&new.tracker_prefix)
    .bind(new.is_fork)
    .bind(&new.upstream_owner)
    .bind(&new.upstream_repo)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert project {}/{}", new.owner, new.repo))?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects owned by a user, ordered by creation time.
pub async fn list_projects_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects for user")?;

    Ok(projects)
}

/// Update mutable project metadata (default branch and tracker prefix).
pub async fn update_project_metadata(
    pool: &PgPool,
    id: Uuid,
    default_branch: &str,
    tracker_prefix: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE projects SET default_branch = $1, tracker_prefix = $2 WHERE id = $3",
    )
    .bind(default_branch)
    .bind(tracker_prefix)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update project metadata")?;

    Ok(result.rows_affected())
}

/// Delete a project. Tasks, subtasks, and agent runs cascade via the schema.
pub async fn delete_project(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM projects WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete project")?;

    Ok(result.rows_affected())
}
