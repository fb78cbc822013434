//! Test fixtures shared by the tether crates.
//!
//! A single PostgreSQL server is shared by every test in a binary; each test
//! gets a throwaway database on it with migrations applied.
//!
//! The server comes from `TETHER_TEST_PG_URL` when set (a CI service
//! container, for instance) and is otherwise started on first use through
//! testcontainers.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use tether_db::models::{Computing, ComputingKind, Container, ContainerRuntime, Registry};
use tether_db::pool;
use tether_db::queries::computings::{self, NewComputing};
use tether_db::queries::containers::{self, NewContainer};

struct SharedPg {
    base_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn start_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("TETHER_TEST_PG_URL") {
        return SharedPg {
            base_url: url.trim_end_matches('/').to_owned(),
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("16")
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedPg {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

/// Server root URL of the shared PostgreSQL (no database name).
pub async fn pg_url() -> &'static str {
    &SHARED_PG.get_or_init(start_shared_pg).await.base_url
}

async fn maintenance_pool() -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{}/postgres", pg_url().await))
        .await
        .expect("failed to connect to maintenance database")
}

/// Create a migrated throwaway database. Returns the pool and the database
/// name to hand to [`drop_test_db`].
pub async fn create_test_db() -> (PgPool, String) {
    let db_name = format!("tether_test_{}", Uuid::new_v4().simple());

    let maint = maintenance_pool().await;
    maint
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create {db_name}: {e}"));
    maint.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{}/{db_name}", pg_url().await))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {db_name}: {e}"));

    pool::run_migrations(&pool)
        .await
        .expect("migrations should succeed");

    (pool, db_name)
}

/// Drop a database created by [`create_test_db`]. Idempotent.
pub async fn drop_test_db(db_name: &str) {
    let maint = maintenance_pool().await;
    let _ = maint
        .execute(
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
            )
            .as_str(),
        )
        .await;
    let _ = maint
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    maint.close().await;
}

/// Register a shared docker container spec listening on 8080.
pub async fn seed_container(pool: &PgPool) -> Container {
    containers::insert_container(
        pool,
        &NewContainer {
            owner_id: None,
            name: "demo".to_owned(),
            image: "demo/image".to_owned(),
            runtime: ContainerRuntime::Docker,
            registry: Registry::DockerHub,
            ports: Some("8080".to_owned()),
            supports_dynamic_ports: false,
            supports_user_auth: false,
            supports_pass_auth: true,
        },
    )
    .await
    .expect("failed to seed container")
}

/// Register a shared computing resource of the given kind.
pub async fn seed_computing(pool: &PgPool, kind: ComputingKind) -> Computing {
    let remote = kind != ComputingKind::Local;
    computings::insert_computing(
        pool,
        &NewComputing {
            owner_id: None,
            name: format!("{kind}-resource"),
            kind,
            requires_sys_conf: remote,
            requires_user_conf: remote,
            requires_user_keys: remote,
            supports_docker: !remote,
            supports_singularity: remote,
        },
    )
    .await
    .expect("failed to seed computing resource")
}
