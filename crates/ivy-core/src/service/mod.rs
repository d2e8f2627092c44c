//! Service layer: validated entry points for external requests.
//!
//! Each operation validates the state-machine transition, mutates the
//! durable store, publishes events after the mutation commits, and -- for
//! agent-spawning actions -- hands off to the agent manager and returns.

pub mod projects;
pub mod subtasks;
pub mod tasks;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::CoreConfig;
use crate::credentials::CredentialProvider;
use crate::events::EventHub;
use crate::hosting::{HostingApi, RepoSyncer};
use crate::manager::AgentSpawner;
use crate::tracker::TrackerAdapter;

/// Shared wiring for the service layer, injected at startup.
#[derive(Clone)]
pub struct ServiceCtx {
    pub pool: PgPool,
    pub hub: Arc<EventHub>,
    pub tracker: Arc<dyn TrackerAdapter>,
    pub hosting: Arc<dyn HostingApi>,
    pub spawner: Arc<dyn AgentSpawner>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub syncer: RepoSyncer,
    pub config: CoreConfig,
}
