use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

use crate::config::DbConfig;

/// Migrations embedded at compile time from `crates/tether-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Tether's tables, parents before the tables that reference them.
pub const TABLES: [&str; 6] = [
    "containers",
    "computings",
    "computing_sys_conf",
    "computing_user_conf",
    "keypairs",
    "tasks",
];

/// The CLI runs one command per process; a handful of connections is plenty.
const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

fn options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = options(MAX_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    debug!(max_connections = MAX_CONNECTIONS, "database pool ready");
    Ok(pool)
}

/// Run all pending embedded migrations against the pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run tether migrations")?;

    let latest = MIGRATOR.iter().map(|m| m.version).max().unwrap_or_default();
    info!(version = latest, "tether schema up to date");
    Ok(())
}

/// `CREATE DATABASE` takes no bind parameters, so the name is spliced in
/// and must be a plain identifier.
fn check_database_name(name: &str) -> Result<()> {
    let plain = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !plain || name.starts_with(|c: char| c.is_ascii_digit()) {
        bail!("database name {name:?} must be letters, digits and underscores");
    }
    Ok(())
}

/// Create the configured database through the server's `postgres`
/// database unless it already exists. Returns whether it was created.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let db_name = config
        .database_name()
        .context("database URL names no database")?;
    check_database_name(db_name)?;

    let maintenance_url = config.maintenance_url();
    let maintenance = options(1)
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maintenance)
            .await
            .context("failed to query pg_database")?;

    if !exists {
        maintenance
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    } else {
        debug!(db = db_name, "database already exists");
    }

    maintenance.close().await;
    Ok(!exists)
}

/// Row count of each of [`TABLES`], in that order, for `tether db-init`.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}; has the schema been migrated?"))?;
        counts.push((table, count));
    }
    Ok(counts)
}
