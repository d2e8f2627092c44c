//! Test support for ivy's integration suites.
//!
//! One PostgreSQL server is shared per test binary; every test carves out
//! its own throwaway database through [`TestDb`]. The server comes from
//! either `IVY_TEST_PG_URL` (an externally managed instance, e.g. a
//! nextest setup script) or a testcontainers instance started on first
//! use and kept alive for the life of the process.

use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use ivy_db::config::DbConfig;
use ivy_db::pool;

/// The process-wide PostgreSQL server.
struct Server {
    /// Config pointing at the server's admin database.
    admin: DbConfig,
    /// Keeps the container alive; absent when an external URL is used.
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<Server> = OnceCell::const_new();

async fn server() -> &'static Server {
    SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("IVY_TEST_PG_URL") {
                return Server {
                    admin: DbConfig::new(url).admin(),
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");

            Server {
                admin: DbConfig::new(format!(
                    "postgresql://postgres:postgres@{host}:{port}/postgres"
                )),
                _container: Some(container),
            }
        })
        .await
}

async fn admin_pool() -> PgPool {
    let server = server().await;
    pool::connect(&server.admin, 1)
        .await
        .expect("failed to reach test PostgreSQL admin database")
}

/// One disposable, fully migrated database inside the shared server.
///
/// Create with [`TestDb::create`], use `pool`, and call [`TestDb::finish`]
/// at the end of the test to close the pool and drop the database.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    pub async fn create() -> Self {
        let name = format!("ivy_test_{}", Uuid::new_v4().simple());

        let admin = admin_pool().await;
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
        admin.close().await;

        let config = server().await.admin.sibling(&name);
        let pool = pool::connect(&config, 5)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {name}: {e}"));
        pool::migrate(&pool, pool::migrations_dir())
            .await
            .expect("migrations should apply cleanly to a fresh database");

        Self { pool, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the pool and drop the database. Lingering connections are
    /// terminated first so the drop cannot hang; a database that is
    /// already gone is fine.
    pub async fn finish(self) {
        self.pool.close().await;

        let admin = admin_pool().await;
        let kick = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = admin.execute(kick.as_str()).await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        admin.close().await;
    }
}

// ---------------------------------------------------------------------------
// Entity fixtures
// ---------------------------------------------------------------------------

use ivy_db::models::{Project, Subtask, Task};
use ivy_db::queries::{projects as project_db, subtasks as subtask_db, tasks as task_db};

/// Insert a minimal direct-clone project rooted at `clone_path`.
pub async fn seed_project(pool: &PgPool, clone_path: &str) -> Project {
    project_db::insert_project(
        pool,
        &project_db::NewProject {
            user_id: Uuid::new_v4(),
            owner: "octocat".into(),
            repo: format!("hello-{}", Uuid::new_v4().simple()),
            default_branch: "main".into(),
            clone_path: clone_path.to_string(),
            tracker_prefix: "iv".into(),
            is_fork: false,
            upstream_owner: None,
            upstream_repo: None,
        },
    )
    .await
    .expect("seed project")
}

/// Insert a task (status `planning`) under a project.
pub async fn seed_task(pool: &PgPool, project_id: Uuid) -> Task {
    task_db::insert_task(pool, project_id, "Add OAuth", "Support login via OAuth.")
        .await
        .expect("seed task")
}

/// Insert a subtask mirroring a tracker issue (status `pending`).
pub async fn seed_subtask(pool: &PgPool, task_id: Uuid, issue_id: &str) -> Subtask {
    let position = subtask_db::next_position(pool, task_id)
        .await
        .expect("next position");
    subtask_db::upsert_subtask(
        pool,
        &subtask_db::NewSubtask {
            task_id,
            issue_id: issue_id.to_string(),
            title: format!("Unit {issue_id}"),
            spec: "The spec".into(),
            plan: "Step 1".into(),
            position,
        },
    )
    .await
    .expect("seed subtask")
}
