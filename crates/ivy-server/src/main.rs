mod config;
mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ivy_core::config::CoreConfig;
use ivy_core::credentials::{CredentialProvider, StaticCredentials};
use ivy_core::events::EventHub;
use ivy_core::hosting::github::GitHubApi;
use ivy_core::hosting::RepoSyncer;
use ivy_core::launcher::AgentCliLauncher;
use ivy_core::manager::{AgentManager, AgentSpawner};
use ivy_core::service::ServiceCtx;
use ivy_core::supervisor::SupervisorDeps;
use ivy_core::tailer::LogTailer;
use ivy_core::tracker::TrackerCli;
use ivy_db::pool;

use config::{AgentSection, ConfigFile, DatabaseSection, AuthSection, IvyConfig};
use state::AppState;

/// How long shutdown waits for supervisors to drain.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Store pool size: sized for concurrent supervisors plus the sync worker
/// and request handlers.
const DB_POOL_SIZE: u32 = 10;

#[derive(Parser)]
#[command(name = "ivy", about = "Orchestrates autonomous coding agents")]
struct Cli {
    /// Database URL (overrides IVY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an ivy config file with freshly generated secrets
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/ivy")]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and apply migrations
    DbInit,
    /// Run the orchestration server
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve { bind, port } => cmd_serve(cli.database_url.as_deref(), &bind, port).await,
    }
}

fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::default_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_string(),
        },
        auth: AuthSection {
            token_encryption_key: config::generate_secret(),
            jwt_secret: config::generate_secret(),
        },
        engine: Default::default(),
        agent: AgentSection::default(),
    };
    file.write(&path)?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = IvyConfig::resolve(cli_db_url)?;
    let db = pool::prepare(&resolved.db_config, DB_POOL_SIZE).await?;
    let counts = pool::entity_counts(&db).await?;
    println!(
        "database ready at {} ({} projects, {} tasks, {} subtasks, {} agent runs)",
        resolved.db_config.url(),
        counts.projects,
        counts.tasks,
        counts.subtasks,
        counts.agent_runs
    );
    Ok(())
}

/// The fully wired engine: services, manager, and the background workers'
/// cancellation token.
struct Engine {
    ctx: ServiceCtx,
    manager: Arc<AgentManager>,
}

async fn build_engine(cli_db_url: Option<&str>) -> Result<(Engine, CancellationToken)> {
    let resolved = IvyConfig::resolve(cli_db_url)?;
    let core: CoreConfig = resolved.core;

    let db = pool::connect(&resolved.db_config, DB_POOL_SIZE).await?;

    let hub = Arc::new(EventHub::new(
        core.event_channel_buffer,
        core.sse_max_connections_per_user,
    ));
    let tailer = Arc::new(LogTailer::new(Arc::clone(&hub), core.log_tail_poll));
    let tracker = Arc::new(TrackerCli::new("trk"));
    let hosting = Arc::new(GitHubApi::new());
    let launcher = Arc::new(
        AgentCliLauncher::new(resolved.agent.binary.clone())
            .with_args(resolved.agent.args.clone()),
    );
    let syncer = RepoSyncer::new();

    // The encrypted credential store is an external collaborator; until it
    // is attached, a fixed token from the environment stands in.
    let access_token = std::env::var("IVY_ACCESS_TOKEN")
        .context("IVY_ACCESS_TOKEN must be set (hosting access token)")?;
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::new(access_token));

    let deps = SupervisorDeps {
        pool: db.clone(),
        hub: Arc::clone(&hub),
        tailer,
        tracker: tracker.clone(),
        hosting: hosting.clone(),
        launcher,
        syncer: syncer.clone(),
        config: core.clone(),
    };

    let manager = Arc::new(AgentManager::new(deps, Arc::clone(&credentials)));
    let spawner: Arc<dyn AgentSpawner> = Arc::new(Arc::clone(&manager));

    let sync_cancel = CancellationToken::new();
    tokio::spawn(ivy_core::sync::sync_worker(
        db.clone(),
        tracker.clone(),
        Arc::clone(&hub),
        core.sync_interval,
        sync_cancel.clone(),
    ));

    let ctx = ServiceCtx {
        pool: db,
        hub,
        tracker,
        hosting,
        spawner,
        credentials,
        syncer,
        config: core,
    };

    Ok((Engine { ctx, manager }, sync_cancel))
}

async fn cmd_serve(cli_db_url: Option<&str>, bind: &str, port: u16) -> Result<()> {
    let (engine, sync_cancel) = build_engine(cli_db_url).await?;

    // Reconcile whatever a previous instance left running.
    let report = ivy_core::recovery::recover(
        &engine.ctx.pool,
        &engine.ctx.hub,
        engine.ctx.spawner.as_ref(),
        engine.ctx.config.agent_max_retries,
    )
    .await
    .map_err(anyhow::Error::new)?;
    if report.orphaned_runs > 0 {
        warn!(
            orphaned = report.orphaned_runs,
            respawned = report.respawned.len(),
            "recovered orphaned agent runs"
        );
    }

    let app = routes::build_router(AppState {
        ctx: engine.ctx.clone(),
    });

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("ivy listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining supervisors");
    sync_cancel.cancel();
    engine.manager.shutdown(SHUTDOWN_DEADLINE).await;
    info!("ivy shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
