//! Agent supervisors: the retry-bounded loops that drive a single Planner
//! or Worker to completion.
//!
//! Supervisors consume the durable store, the adapters, and the event hub
//! directly; they never call back into the service layer. Concrete
//! implementations are injected here once at startup.

pub mod backoff;
pub mod planner;
pub mod worker;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::CoreConfig;
use crate::events::EventHub;
use crate::hosting::{HostingApi, RepoSyncer};
use crate::launcher::ProcessLauncher;
use crate::tailer::LogTailer;
use crate::tracker::TrackerAdapter;

/// Everything a supervisor needs, wired by constructor injection.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub pool: PgPool,
    pub hub: Arc<EventHub>,
    pub tailer: Arc<LogTailer>,
    pub tracker: Arc<dyn TrackerAdapter>,
    pub hosting: Arc<dyn HostingApi>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub syncer: RepoSyncer,
    pub config: CoreConfig,
}
