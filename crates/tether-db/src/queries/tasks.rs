//! Database query functions for the `tasks` table.

use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ComputingOptions, Task, TaskStatus};

/// Fields supplied when a task is created.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner_id: Uuid,
    pub name: String,
    pub container_id: Uuid,
    pub computing_id: Uuid,
    pub port: Option<i32>,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    pub extra_binds: Option<String>,
    pub options: ComputingOptions,
}

/// What a driver learned from a successful launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Launch {
    pub tid: Option<String>,
    pub pid: Option<i64>,
    pub ip: Option<String>,
    pub port: Option<i32>,
    /// Applied only while the task is still `created`, so a launch recorded
    /// after the agent callback does not demote `running`.
    pub status: Option<TaskStatus>,
}

const LIVE_STATUSES: &str = "('created', 'submitted', 'running')";

/// Insert a new task in status `created`.
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let options =
        serde_json::to_value(&new.options).context("failed to encode computing options")?;
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
         (owner_id, name, container_id, computing_id, port, auth_user, auth_pass, extra_binds, options) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.owner_id)
    .bind(&new.name)
    .bind(new.container_id)
    .bind(new.computing_id)
    .bind(new.port)
    .bind(&new.auth_user)
    .bind(&new.auth_pass)
    .bind(&new.extra_binds)
    .bind(options)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List a user's tasks, oldest first.
pub async fn list_tasks_for_owner(pool: &PgPool, owner_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE owner_id = $1 ORDER BY created_at ASC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for owner")?;

    Ok(tasks)
}

/// Persist the outcome of a driver launch.
///
/// `ip` and `port` are only overwritten when the launch supplies them.
pub async fn record_launch(pool: &PgPool, id: Uuid, launch: &Launch) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET \
            tid = $2, \
            pid = $3, \
            ip = COALESCE($4, ip), \
            port = COALESCE($5, port), \
            status = CASE WHEN $6::text IS NOT NULL AND status = 'created' THEN $6::text ELSE status END \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(&launch.tid)
    .bind(launch.pid)
    .bind(&launch.ip)
    .bind(launch.port)
    .bind(launch.status)
    .fetch_optional(pool)
    .await
    .context("failed to record task launch")?;

    task.with_context(|| format!("task {id} not found"))
}

/// Update the status of a task.
///
/// Moving to a terminal status also releases the tunnel port and forgets
/// the relay pid, so the port can be claimed by another task.
pub async fn update_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks SET \
            status = $1, \
            tunnel_port = CASE WHEN $1 IN ('stopped', 'exited') THEN NULL ELSE tunnel_port END, \
            tunnel_pid = CASE WHEN $1 IN ('stopped', 'exited') THEN NULL ELSE tunnel_pid END \
         WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Store the address reported by the agent and mark the task running.
///
/// Returns `false` when no task has this id.
pub async fn set_task_address(pool: &PgPool, id: Uuid, ip: &str, port: i32) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET ip = $2, port = $3, status = 'running' WHERE id = $1",
    )
    .bind(id)
    .bind(ip)
    .bind(port)
    .execute(pool)
    .await
    .context("failed to set task address")?;

    Ok(result.rows_affected() > 0)
}

/// Claim a relay port for a task.
///
/// Returns the task's existing port when it already holds one, the first
/// port of `range` not held by another live task otherwise, and `None` when
/// every port is taken. Two concurrent claims racing for the same port are
/// separated by the `tasks_live_tunnel_port` unique index; the loser retries,
/// at most once per port in the range.
pub async fn claim_tunnel_port(
    pool: &PgPool,
    id: Uuid,
    range: RangeInclusive<u16>,
) -> Result<Option<i32>> {
    let attempts = usize::from(range.end().saturating_sub(*range.start())) + 2;

    for _ in 0..attempts {
        let claimed = sqlx::query_scalar::<_, Option<i32>>(&format!(
            "UPDATE tasks SET tunnel_port = ( \
                SELECT p FROM generate_series($2::int, $3::int) AS p \
                WHERE p NOT IN ( \
                    SELECT tunnel_port FROM tasks \
                    WHERE tunnel_port IS NOT NULL AND status IN {LIVE_STATUSES} \
                ) \
                ORDER BY p LIMIT 1 \
             ) \
             WHERE id = $1 AND tunnel_port IS NULL \
             RETURNING tunnel_port"
        ))
        .bind(id)
        .bind(i32::from(*range.start()))
        .bind(i32::from(*range.end()))
        .fetch_optional(pool)
        .await;

        match claimed {
            Ok(Some(port)) => return Ok(port),
            Ok(None) => {
                // Either the task already holds a port or it does not exist.
                let existing = sqlx::query_scalar::<_, Option<i32>>(
                    "SELECT tunnel_port FROM tasks WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("failed to read tunnel port")?;
                return match existing {
                    Some(port) => Ok(port),
                    None => anyhow::bail!("task {id} not found"),
                };
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tracing::debug!(task_id = %id, "tunnel port claim collided, retrying");
                continue;
            }
            Err(e) => return Err(e).context("failed to claim tunnel port"),
        }
    }

    anyhow::bail!("could not claim a tunnel port for task {id} after {attempts} attempts")
}

/// Record (or clear) the pid of the task's relay process.
pub async fn set_tunnel_pid(pool: &PgPool, id: Uuid, pid: Option<i32>) -> Result<()> {
    sqlx::query("UPDATE tasks SET tunnel_pid = $2 WHERE id = $1")
        .bind(id)
        .bind(pid)
        .execute(pool)
        .await
        .context("failed to set tunnel pid")?;
    Ok(())
}

/// Delete a task, but only from a terminal status. Returns whether a row
/// was removed.
pub async fn delete_terminal_task(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result =
        sqlx::query("DELETE FROM tasks WHERE id = $1 AND status IN ('stopped', 'exited')")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete task")?;

    Ok(result.rows_affected() > 0)
}

/// Delete a task regardless of status. Used to discard a record whose
/// launch failed.
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;
    Ok(())
}
