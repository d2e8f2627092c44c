//! Agent manager: thread-safe registry of running supervisors with
//! cooperative cancellation and graceful shutdown.
//!
//! The manager exclusively owns each supervisor's cancellation handle;
//! handles are never handed out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use ivy_db::models::AgentKind;
use ivy_db::queries::{projects as project_db, subtasks as subtask_db, tasks as task_db};

use crate::credentials::CredentialProvider;
use crate::error::{CoreError, Result};
use crate::supervisor::{SupervisorDeps, planner, worker};

/// How services ask for agents; implemented by [`AgentManager`]. The
/// indirection keeps the service layer free of supervisor internals.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Spawn a planner for a task. `Conflict` when one is already running.
    async fn spawn_planner(&self, task_id: Uuid) -> Result<()>;

    /// Spawn a worker for a subtask. `Conflict` when one is already
    /// running.
    async fn spawn_worker(&self, subtask_id: Uuid) -> Result<()>;

    /// Cancel every agent attached to a task (its planner and its
    /// subtasks' workers).
    async fn kill_agents_for_task(&self, task_id: Uuid);

    /// Cancel the worker for one subtask.
    async fn kill_agents_for_subtask(&self, subtask_id: Uuid);
}

/// Descriptor for one running supervisor. Keyed by the task id (planner)
/// or subtask id (worker).
struct RunningAgent {
    cancel: CancellationToken,
    kind: AgentKind,
    task_id: Uuid,
}

/// Registry of running supervisors.
pub struct AgentManager {
    deps: SupervisorDeps,
    credentials: Arc<dyn CredentialProvider>,
    root: CancellationToken,
    registry: Mutex<HashMap<Uuid, RunningAgent>>,
    supervisors: TaskTracker,
}

impl AgentManager {
    pub fn new(deps: SupervisorDeps, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            deps,
            credentials,
            root: CancellationToken::new(),
            registry: Mutex::new(HashMap::new()),
            supervisors: TaskTracker::new(),
        }
    }

    /// Reserve a registry slot for `key`, or fail with `Conflict`.
    fn register(&self, key: Uuid, kind: AgentKind, task_id: Uuid) -> Result<CancellationToken> {
        let mut registry = self.registry.lock().expect("agent registry lock poisoned");
        if registry.contains_key(&key) {
            return Err(CoreError::conflict(format!(
                "an agent is already running for {key}"
            )));
        }
        let cancel = self.root.child_token();
        registry.insert(
            key,
            RunningAgent {
                cancel: cancel.clone(),
                kind,
                task_id,
            },
        );
        Ok(cancel)
    }

    fn deregister(&self, key: Uuid) {
        self.registry
            .lock()
            .expect("agent registry lock poisoned")
            .remove(&key);
    }

    /// Whether any supervisor is registered for the given key.
    pub fn is_running(&self, key: Uuid) -> bool {
        self.registry
            .lock()
            .expect("agent registry lock poisoned")
            .contains_key(&key)
    }

    /// Cancel the root token and wait for supervisors to drain, bounded by
    /// the caller-supplied deadline.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("agent manager shutting down");
        self.root.cancel();
        self.supervisors.close();
        if tokio::time::timeout(deadline, self.supervisors.wait()).await.is_err() {
            warn!("shutdown deadline expired with supervisors still draining");
        }
    }
}

#[async_trait]
impl AgentSpawner for Arc<AgentManager> {
    async fn spawn_planner(&self, task_id: Uuid) -> Result<()> {
        let task = task_db::get_task(&self.deps.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        let project = project_db::get_project(&self.deps.pool, task.project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {}", task.project_id)))?;

        let cancel = self.register(task_id, AgentKind::Planner, task_id)?;

        // Credentials are fetched after the slot is held so a decryption
        // failure cannot race a second spawn into a double run.
        if let Err(e) = self.credentials.access_token(project.user_id).await {
            self.deregister(task_id);
            return Err(CoreError::Internal(
                e.context("failed to obtain hosting credentials"),
            ));
        }

        let manager = Arc::clone(self);
        self.supervisors.spawn(async move {
            let result = planner::run_planner(&manager.deps, &project, &task, cancel).await;
            if let Err(e) = result {
                error!(%task_id, error = %e, "planner supervisor failed");
            }
            manager.deregister(task_id);
        });

        Ok(())
    }

    async fn spawn_worker(&self, subtask_id: Uuid) -> Result<()> {
        let subtask = subtask_db::get_subtask(&self.deps.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id}")))?;
        let task = task_db::get_task(&self.deps.pool, subtask.task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {}", subtask.task_id)))?;
        let project = project_db::get_project(&self.deps.pool, task.project_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("project {}", task.project_id)))?;

        let cancel = self.register(subtask_id, AgentKind::Worker, task.id)?;

        let token = match self.credentials.access_token(project.user_id).await {
            Ok(token) => token,
            Err(e) => {
                self.deregister(subtask_id);
                return Err(CoreError::Internal(
                    e.context("failed to obtain hosting credentials"),
                ));
            }
        };

        let manager = Arc::clone(self);
        self.supervisors.spawn(async move {
            let result = worker::run_worker(
                &manager.deps,
                &project,
                &task,
                subtask_id,
                &token,
                cancel,
            )
            .await;
            if let Err(e) = result {
                error!(%subtask_id, error = %e, "worker supervisor failed");
            }
            manager.deregister(subtask_id);
        });

        Ok(())
    }

    async fn kill_agents_for_task(&self, task_id: Uuid) {
        let registry = self.registry.lock().expect("agent registry lock poisoned");
        for (key, agent) in registry.iter() {
            if agent.task_id == task_id {
                info!(%key, kind = %agent.kind, "cancelling agent for task");
                agent.cancel.cancel();
            }
        }
    }

    async fn kill_agents_for_subtask(&self, subtask_id: Uuid) {
        let registry = self.registry.lock().expect("agent registry lock poisoned");
        if let Some(agent) = registry.get(&subtask_id) {
            info!(%subtask_id, "cancelling agent for subtask");
            agent.cancel.cancel();
        }
    }
}
