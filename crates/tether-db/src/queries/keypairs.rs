//! Database query functions for the `keypairs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::KeyPair;

/// Register a key pair. When `make_default` is set, any previous default of
/// the same user is cleared in the same transaction.
pub async fn insert_keypair(
    pool: &PgPool,
    user_id: Uuid,
    private_key_file: &str,
    public_key_file: &str,
    make_default: bool,
) -> Result<KeyPair> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    if make_default {
        sqlx::query("UPDATE keypairs SET is_default = false WHERE user_id = $1 AND is_default")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous default key pair")?;
    }

    let keypair = sqlx::query_as::<_, KeyPair>(
        "INSERT INTO keypairs (user_id, private_key_file, public_key_file, is_default) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(user_id)
    .bind(private_key_file)
    .bind(public_key_file)
    .bind(make_default)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert key pair")?;

    tx.commit().await.context("failed to commit key pair")?;
    Ok(keypair)
}

pub async fn get_default_keypair(pool: &PgPool, user_id: Uuid) -> Result<Option<KeyPair>> {
    let keypair = sqlx::query_as::<_, KeyPair>(
        "SELECT * FROM keypairs WHERE user_id = $1 AND is_default",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch default key pair")?;

    Ok(keypair)
}

pub async fn list_keypairs(pool: &PgPool, user_id: Uuid) -> Result<Vec<KeyPair>> {
    let keypairs = sqlx::query_as::<_, KeyPair>(
        "SELECT * FROM keypairs WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list key pairs")?;

    Ok(keypairs)
}
