//! Project registration and removal.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use ivy_db::models::Project;
use ivy_db::queries::projects as project_db;

use crate::error::{CoreError, Result};
use crate::hosting::{add_upstream_remote, authenticated_clone_url, clone_repo};
use crate::paths;

use super::ServiceCtx;

/// Host for clone URLs and canonical upstream remotes.
const HOSTING_HOST: &str = "github.com";

/// Parameters for registering a project.
#[derive(Debug, Clone)]
pub struct CreateProject {
    pub user_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
    pub tracker_prefix: String,
    pub is_fork: bool,
    pub upstream_owner: Option<String>,
    pub upstream_repo: Option<String>,
}

pub struct ProjectService {
    ctx: ServiceCtx,
}

impl ProjectService {
    pub fn new(ctx: ServiceCtx) -> Self {
        Self { ctx }
    }

    /// Register a repository: clone it, wire remotes, initialize the
    /// tracker, then write the durable record. The clone directory exists
    /// before the record does.
    pub async fn create(&self, request: CreateProject) -> Result<Project> {
        if request.owner.is_empty() || request.repo.is_empty() {
            return Err(CoreError::InvalidRequest(
                "owner and repo must be non-empty".into(),
            ));
        }
        if request.is_fork
            && (request.upstream_owner.is_none() || request.upstream_repo.is_none())
        {
            return Err(CoreError::InvalidRequest(
                "forks require upstream owner and repo".into(),
            ));
        }

        let clone_path = paths::project_clone_dir(
            &self.ctx.config.data_dir,
            request.user_id,
            &request.owner,
            &request.repo,
        );
        if clone_path.exists() {
            return Err(CoreError::conflict(format!(
                "a clone already exists at {}",
                clone_path.display()
            )));
        }

        let token = self
            .ctx
            .credentials
            .access_token(request.user_id)
            .await
            .map_err(CoreError::Internal)?;

        // For forks, materialize the fork first; the adapter polls until
        // the asynchronous fork exists.
        if request.is_fork {
            self.ctx
                .hosting
                .create_fork(
                    &token,
                    request.upstream_owner.as_deref().expect("validated above"),
                    request.upstream_repo.as_deref().expect("validated above"),
                )
                .await
                .map_err(|e| CoreError::UpstreamFailure(format!("fork failed: {e:#}")))?;
        }

        let url = authenticated_clone_url(HOSTING_HOST, &request.owner, &request.repo, &token);
        clone_repo(&url, &clone_path)
            .await
            .map_err(|e| CoreError::UpstreamFailure(format!("clone failed: {e:#}")))?;

        // The upstream remote is added once, with a canonical HTTPS URL.
        if request.is_fork {
            let upstream_url = format!(
                "https://{HOSTING_HOST}/{}/{}.git",
                request.upstream_owner.as_deref().expect("validated above"),
                request.upstream_repo.as_deref().expect("validated above"),
            );
            add_upstream_remote(&clone_path, &upstream_url)
                .await
                .map_err(|e| CoreError::UpstreamFailure(format!("remote setup failed: {e:#}")))?;
        }

        self.ctx
            .tracker
            .init(&clone_path, &request.tracker_prefix, &CancellationToken::new())
            .await
            .map_err(|e| CoreError::ToolUnavailable(format!("tracker init failed: {e:#}")))?;

        let project = project_db::insert_project(
            &self.ctx.pool,
            &project_db::NewProject {
                user_id: request.user_id,
                owner: request.owner,
                repo: request.repo,
                default_branch: request.default_branch,
                clone_path: clone_path.to_string_lossy().into_owned(),
                tracker_prefix: request.tracker_prefix,
                is_fork: request.is_fork,
                upstream_owner: request.upstream_owner,
                upstream_repo: request.upstream_repo,
            },
        )
        .await?;

        info!(project_id = %project.id, clone = %project.clone_path, "project registered");
        Ok(project)
    }

    pub async fn get(&self, project_id: Uuid) -> Result<Project> {
        project_db::get_project(&self.ctx.pool, project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {project_id}")))
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Project>> {
        Ok(project_db::list_projects_for_user(&self.ctx.pool, user_id).await?)
    }

    /// Update the mutable project metadata.
    pub async fn update_metadata(
        &self,
        project_id: Uuid,
        default_branch: &str,
        tracker_prefix: &str,
    ) -> Result<Project> {
        if default_branch.is_empty() || tracker_prefix.is_empty() {
            return Err(CoreError::InvalidRequest(
                "default_branch and tracker_prefix must be non-empty".into(),
            ));
        }
        let rows = project_db::update_project_metadata(
            &self.ctx.pool,
            project_id,
            default_branch,
            tracker_prefix,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!("project {project_id}")));
        }
        self.get(project_id).await
    }

    /// Remove the clone best-effort, then the record.
    pub async fn delete(&self, project_id: Uuid) -> Result<()> {
        let project = self.get(project_id).await?;

        let clone_path = Path::new(&project.clone_path);
        if clone_path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(clone_path).await {
                warn!(project_id = %project_id, error = %e, "failed to remove clone (non-fatal)");
            }
        }

        let rows = project_db::delete_project(&self.ctx.pool, project_id).await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!("project {project_id}")));
        }
        Ok(())
    }
}
