//! REST surface over the service layer. Handlers stay thin: parse, call
//! the service, map the error.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use ivy_core::service::projects::{CreateProject, ProjectService};
use ivy_core::service::subtasks::SubtaskService;
use ivy_core::service::tasks::TaskService;
use ivy_db::models::{Project, Subtask, Task};
use ivy_db::queries::agent_runs as run_db;

use crate::error::ApiError;
use crate::sse;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", post(create_project).get(list_projects))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/{id}/tasks", post(create_task).get(list_tasks))
        .route("/api/projects/{id}/events", get(sse::events))
        .route(
            "/api/events/{conn_id}/log-subscriptions",
            axum::routing::put(update_log_subscriptions),
        )
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/retry-planning", post(retry_planning))
        .route("/api/tasks/{id}/subtasks", get(list_subtasks))
        .route("/api/subtasks/{id}", get(get_subtask).delete(delete_subtask))
        .route("/api/subtasks/{id}/start", post(start_subtask))
        .route("/api/subtasks/{id}/retry", post(retry_subtask))
        .route("/api/subtasks/{id}/merge", post(merge_subtask))
        .route("/api/subtasks/{id}/position", patch(reorder_subtask))
        .route("/api/subtasks/{id}/runs", get(list_runs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProjectBody {
    pub user_id: Uuid,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    pub tracker_prefix: String,
    #[serde(default)]
    pub is_fork: bool,
    pub upstream_owner: Option<String>,
    pub upstream_repo: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = ProjectService::new(state.ctx.clone())
        .create(CreateProject {
            user_id: body.user_id,
            owner: body.owner,
            repo: body.repo,
            default_branch: body.default_branch,
            tracker_prefix: body.tracker_prefix,
            is_fork: body.is_fork,
            upstream_owner: body.upstream_owner,
            upstream_repo: body.upstream_repo,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: Uuid,
}

async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<Project>>, ApiError> {
    let projects = ProjectService::new(state.ctx.clone())
        .list_for_user(query.user_id)
        .await?;
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(ProjectService::new(state.ctx.clone()).get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectBody {
    pub default_branch: String,
    pub tracker_prefix: String,
}

async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProjectBody>,
) -> Result<Json<Project>, ApiError> {
    let project = ProjectService::new(state.ctx.clone())
        .update_metadata(id, &body.default_branch, &body.tracker_prefix)
        .await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    ProjectService::new(state.ctx.clone()).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

async fn create_task(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = TaskService::new(state.ctx.clone())
        .create(project_id, &body.title, &body.description)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = TaskService::new(state.ctx.clone())
        .list_for_project(project_id)
        .await?;
    Ok(Json(tasks))
}

/// A task with its subtasks, for the board view.
#[derive(Debug, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub subtasks: Vec<Subtask>,
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDetail>, ApiError> {
    let task = TaskService::new(state.ctx.clone()).get(id).await?;
    let subtasks = SubtaskService::new(state.ctx.clone())
        .list_for_task(id)
        .await?;
    Ok(Json(TaskDetail { task, subtasks }))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    TaskService::new(state.ctx.clone()).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_planning(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    TaskService::new(state.ctx.clone()).retry_planning(id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Subtasks
// ---------------------------------------------------------------------------

async fn list_subtasks(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Vec<Subtask>>, ApiError> {
    let subtasks = SubtaskService::new(state.ctx.clone())
        .list_for_task(task_id)
        .await?;
    Ok(Json(subtasks))
}

async fn get_subtask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Subtask>, ApiError> {
    Ok(Json(SubtaskService::new(state.ctx.clone()).get(id).await?))
}

async fn start_subtask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    SubtaskService::new(state.ctx.clone()).start(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn retry_subtask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    SubtaskService::new(state.ctx.clone()).retry(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn merge_subtask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    SubtaskService::new(state.ctx.clone()).mark_merged(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    pub position: i32,
}

async fn reorder_subtask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReorderBody>,
) -> Result<StatusCode, ApiError> {
    SubtaskService::new(state.ctx.clone())
        .reorder(id, body.position)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogSubscriptionsBody {
    /// `"all"` or a list of run ids.
    pub runs: serde_json::Value,
}

async fn update_log_subscriptions(
    State(state): State<AppState>,
    Path(conn_id): Path<Uuid>,
    Json(body): Json<LogSubscriptionsBody>,
) -> Result<StatusCode, ApiError> {
    use ivy_core::events::LogSubscription;

    let subscription = if body.runs == serde_json::json!("all") {
        LogSubscription::All
    } else {
        let ids: std::collections::HashSet<Uuid> = serde_json::from_value(body.runs.clone())
            .map_err(|_| {
                ivy_core::error::CoreError::InvalidRequest(
                    "runs must be \"all\" or a list of run ids".into(),
                )
            })?;
        LogSubscription::Runs(ids)
    };

    state.ctx.hub.update_log_subscriptions(conn_id, subscription)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ivy_db::models::AgentRun>>, ApiError> {
    let runs = run_db::list_runs_for_subtask(&state.ctx.pool, id)
        .await
        .map_err(ivy_core::error::CoreError::Internal)?;
    Ok(Json(runs))
}
