use std::ops::RangeInclusive;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use tether_db::models::{Computing, Container, KeyPair, Task, TaskStatus};
use tether_db::queries::tasks::{Launch, NewTask};
use tether_db::queries::{computings, containers, keypairs, tasks};

use super::TaskStore;

#[async_trait]
impl TaskStore for PgPool {
    async fn insert_task(&self, new: &NewTask) -> Result<Task> {
        tasks::insert_task(self, new).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        tasks::get_task(self, id).await
    }

    async fn list_tasks(&self, owner: Uuid) -> Result<Vec<Task>> {
        tasks::list_tasks_for_owner(self, owner).await
    }

    async fn record_launch(&self, id: Uuid, launch: &Launch) -> Result<Task> {
        tasks::record_launch(self, id, launch).await
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        tasks::update_task_status(self, id, status).await
    }

    async fn set_address(&self, id: Uuid, ip: &str, port: i32) -> Result<bool> {
        tasks::set_task_address(self, id, ip, port).await
    }

    async fn claim_tunnel_port(
        &self,
        id: Uuid,
        range: RangeInclusive<u16>,
    ) -> Result<Option<i32>> {
        tasks::claim_tunnel_port(self, id, range).await
    }

    async fn set_tunnel_pid(&self, id: Uuid, pid: Option<i32>) -> Result<()> {
        tasks::set_tunnel_pid(self, id, pid).await
    }

    async fn delete_terminal_task(&self, id: Uuid) -> Result<bool> {
        tasks::delete_terminal_task(self, id).await
    }

    async fn discard_task(&self, id: Uuid) -> Result<()> {
        tasks::delete_task(self, id).await
    }

    async fn get_container(&self, id: Uuid) -> Result<Option<Container>> {
        containers::get_container(self, id).await
    }

    async fn get_computing(&self, id: Uuid) -> Result<Option<Computing>> {
        computings::get_computing(self, id).await
    }

    async fn get_sys_conf(&self, computing_id: Uuid) -> Result<Option<Value>> {
        computings::get_sys_conf(self, computing_id).await
    }

    async fn get_user_conf(&self, computing_id: Uuid, user: Uuid) -> Result<Option<Value>> {
        computings::get_user_conf(self, computing_id, user).await
    }

    async fn default_keypair(&self, user: Uuid) -> Result<Option<KeyPair>> {
        keypairs::get_default_keypair(self, user).await
    }
}
