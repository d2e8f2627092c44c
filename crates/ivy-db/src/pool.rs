//! Pool construction and schema management for the ivy store.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// How long to wait for a connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool against the configured database.
///
/// The caller decides the size: the server matches it to its expected
/// concurrency (supervisors, the sync worker, HTTP handlers), tests use
/// small pools.
pub async fn connect(config: &DbConfig, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(config.url())
        .await
        .with_context(|| format!("ivy store unreachable at {}", config.url()))
}

/// Apply pending schema migrations from `dir`.
///
/// Migrations are read from disk at runtime, so building this crate needs
/// no live database; [`migrations_dir`] locates the files shipped in the
/// crate's source tree.
pub async fn migrate(pool: &PgPool, dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("no migrations at {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("ivy schema migration failed")?;

    info!("ivy schema up to date");
    Ok(())
}

/// The migrations directory shipped with `ivy-db`.
///
/// Resolved from `CARGO_MANIFEST_DIR` at compile time, so it points into
/// the source tree; installed binaries must pass their own directory to
/// [`migrate`].
pub fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Create the configured database if it is missing, then return a
/// migrated pool. Backs `ivy db-init`.
pub async fn prepare(config: &DbConfig, max_connections: u32) -> Result<PgPool> {
    let name = config
        .database()
        .context("database URL does not name a database")?;
    // CREATE DATABASE cannot take a bind parameter; restrict the
    // identifier instead of interpolating arbitrary input.
    if !is_plain_identifier(name) {
        bail!("refusing to create database with name {name:?}");
    }

    let admin = connect(&config.admin(), 1).await?;
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&admin)
            .await
            .context("failed to look up database in pg_database")?;

    if exists {
        info!(db = name, "ivy database already present");
    } else {
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .with_context(|| format!("failed to create database {name}"))?;
        info!(db = name, "ivy database created");
    }
    admin.close().await;

    let pool = connect(config, max_connections).await?;
    migrate(&pool, migrations_dir()).await?;
    Ok(pool)
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Row counts for the board entities, shown by `ivy db-init`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityCounts {
    pub projects: i64,
    pub tasks: i64,
    pub subtasks: i64,
    pub agent_runs: i64,
}

/// Count every entity in one round-trip.
pub async fn entity_counts(pool: &PgPool) -> Result<EntityCounts> {
    let (projects, tasks, subtasks, agent_runs): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM projects), \
                (SELECT COUNT(*) FROM tasks), \
                (SELECT COUNT(*) FROM subtasks), \
                (SELECT COUNT(*) FROM agent_runs)",
    )
    .fetch_one(pool)
    .await
    .context("failed to count store entities")?;

    Ok(EntityCounts {
        projects,
        tasks,
        subtasks,
        agent_runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_check_rejects_injection_shapes() {
        assert!(is_plain_identifier("ivy"));
        assert!(is_plain_identifier("ivy_test_01"));
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("ivy; DROP TABLE tasks"));
        assert!(!is_plain_identifier("ivy-prod"));
    }

    #[test]
    fn migrations_dir_points_into_this_crate() {
        let dir = migrations_dir();
        assert!(dir.ends_with("migrations"));
        assert!(dir.join("0001_initial.sql").exists());
    }
}
