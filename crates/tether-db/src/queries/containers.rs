//! Database query functions for the `containers` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Container, ContainerRuntime, Registry};

/// Fields supplied when a container spec is registered.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub image: String,
    pub runtime: ContainerRuntime,
    pub registry: Registry,
    pub ports: Option<String>,
    pub supports_dynamic_ports: bool,
    pub supports_user_auth: bool,
    pub supports_pass_auth: bool,
}

pub async fn insert_container(pool: &PgPool, new: &NewContainer) -> Result<Container> {
    let container = sqlx::query_as::<_, Container>(
        "INSERT INTO containers \
         (owner_id, name, image, runtime, registry, ports, \
          supports_dynamic_ports, supports_user_auth, supports_pass_auth) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.owner_id)
    .bind(&new.name)
    .bind(&new.image)
    .bind(new.runtime)
    .bind(new.registry)
    .bind(&new.ports)
    .bind(new.supports_dynamic_ports)
    .bind(new.supports_user_auth)
    .bind(new.supports_pass_auth)
    .fetch_one(pool)
    .await
    .context("failed to insert container")?;

    Ok(container)
}

pub async fn get_container(pool: &PgPool, id: Uuid) -> Result<Option<Container>> {
    let container = sqlx::query_as::<_, Container>("SELECT * FROM containers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch container")?;

    Ok(container)
}

/// Shared containers plus the ones owned by `user`.
pub async fn list_containers_visible_to(pool: &PgPool, user: Uuid) -> Result<Vec<Container>> {
    let containers = sqlx::query_as::<_, Container>(
        "SELECT * FROM containers \
         WHERE owner_id IS NULL OR owner_id = $1 \
         ORDER BY name ASC",
    )
    .bind(user)
    .fetch_all(pool)
    .await
    .context("failed to list containers")?;

    Ok(containers)
}
