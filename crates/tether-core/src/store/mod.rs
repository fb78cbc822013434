//! Persistence seam for the orchestration layer.
//!
//! [`TaskStore`] is implemented for `PgPool` (delegating to
//! `tether_db::queries`) and by [`MemoryStore`] for tests and embedding.

mod memory;
mod postgres;

use std::ops::RangeInclusive;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use tether_db::models::{Computing, Container, KeyPair, Task, TaskStatus};
use tether_db::queries::tasks::{Launch, NewTask};

pub use memory::MemoryStore;

/// Everything the task service, drivers and tunnel allocator read or write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, new: &NewTask) -> Result<Task>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    async fn list_tasks(&self, owner: Uuid) -> Result<Vec<Task>>;

    /// Persist a launch; see [`Launch`] for the status rule.
    async fn record_launch(&self, id: Uuid, launch: &Launch) -> Result<Task>;

    /// Set the status. Terminal statuses release the tunnel port and pid.
    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<()>;

    /// Store the agent-reported address and mark the task running. `false`
    /// when the task does not exist.
    async fn set_address(&self, id: Uuid, ip: &str, port: i32) -> Result<bool>;

    /// Atomically claim a relay port; `None` when the range is exhausted.
    async fn claim_tunnel_port(&self, id: Uuid, range: RangeInclusive<u16>)
    -> Result<Option<i32>>;

    async fn set_tunnel_pid(&self, id: Uuid, pid: Option<i32>) -> Result<()>;

    /// Delete a task in a terminal status. `false` when nothing matched.
    async fn delete_terminal_task(&self, id: Uuid) -> Result<bool>;

    /// Delete a task regardless of status.
    async fn discard_task(&self, id: Uuid) -> Result<()>;

    async fn get_container(&self, id: Uuid) -> Result<Option<Container>>;

    async fn get_computing(&self, id: Uuid) -> Result<Option<Computing>>;

    async fn get_sys_conf(&self, computing_id: Uuid) -> Result<Option<Value>>;

    async fn get_user_conf(&self, computing_id: Uuid, user: Uuid) -> Result<Option<Value>>;

    async fn default_keypair(&self, user: Uuid) -> Result<Option<KeyPair>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn TaskStore) {}
};
