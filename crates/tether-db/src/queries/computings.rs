//! Database query functions for `computings` and their conf payloads
//! (`computing_sys_conf`, `computing_user_conf`).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Computing, ComputingKind};

/// Fields supplied when a computing resource is registered.
#[derive(Debug, Clone)]
pub struct NewComputing {
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub kind: ComputingKind,
    pub requires_sys_conf: bool,
    pub requires_user_conf: bool,
    pub requires_user_keys: bool,
    pub supports_docker: bool,
    pub supports_singularity: bool,
}

pub async fn insert_computing(pool: &PgPool, new: &NewComputing) -> Result<Computing> {
    let computing = sqlx::query_as::<_, Computing>(
        "INSERT INTO computings \
         (owner_id, name, kind, requires_sys_conf, requires_user_conf, requires_user_keys, \
          supports_docker, supports_singularity) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.owner_id)
    .bind(&new.name)
    .bind(new.kind)
    .bind(new.requires_sys_conf)
    .bind(new.requires_user_conf)
    .bind(new.requires_user_keys)
    .bind(new.supports_docker)
    .bind(new.supports_singularity)
    .fetch_one(pool)
    .await
    .context("failed to insert computing resource")?;

    Ok(computing)
}

pub async fn get_computing(pool: &PgPool, id: Uuid) -> Result<Option<Computing>> {
    let computing = sqlx::query_as::<_, Computing>("SELECT * FROM computings WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch computing resource")?;

    Ok(computing)
}

/// Shared resources plus the ones owned by `user`.
pub async fn list_computings_visible_to(pool: &PgPool, user: Uuid) -> Result<Vec<Computing>> {
    let computings = sqlx::query_as::<_, Computing>(
        "SELECT * FROM computings \
         WHERE owner_id IS NULL OR owner_id = $1 \
         ORDER BY name ASC",
    )
    .bind(user)
    .fetch_all(pool)
    .await
    .context("failed to list computing resources")?;

    Ok(computings)
}

/// Replace the resource-level conf payload.
pub async fn upsert_sys_conf(
    pool: &PgPool,
    computing_id: Uuid,
    data: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO computing_sys_conf (computing_id, data) VALUES ($1, $2) \
         ON CONFLICT (computing_id) DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
    )
    .bind(computing_id)
    .bind(data)
    .execute(pool)
    .await
    .context("failed to save resource-level conf")?;
    Ok(())
}

pub async fn get_sys_conf(pool: &PgPool, computing_id: Uuid) -> Result<Option<serde_json::Value>> {
    let data = sqlx::query_scalar::<_, serde_json::Value>(
        "SELECT data FROM computing_sys_conf WHERE computing_id = $1",
    )
    .bind(computing_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch resource-level conf")?;

    Ok(data)
}

/// Replace the (resource, user) conf payload.
pub async fn upsert_user_conf(
    pool: &PgPool,
    computing_id: Uuid,
    user_id: Uuid,
    data: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO computing_user_conf (computing_id, user_id, data) VALUES ($1, $2, $3) \
         ON CONFLICT (computing_id, user_id) DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
    )
    .bind(computing_id)
    .bind(user_id)
    .bind(data)
    .execute(pool)
    .await
    .context("failed to save user-level conf")?;
    Ok(())
}

pub async fn get_user_conf(
    pool: &PgPool,
    computing_id: Uuid,
    user_id: Uuid,
) -> Result<Option<serde_json::Value>> {
    let data = sqlx::query_scalar::<_, serde_json::Value>(
        "SELECT data FROM computing_user_conf WHERE computing_id = $1 AND user_id = $2",
    )
    .bind(computing_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch user-level conf")?;

    Ok(data)
}
