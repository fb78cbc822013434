use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use tether_db::models::{Computing, Container, KeyPair, Task, TaskStatus};
use tether_db::queries::tasks::{Launch, NewTask};

use super::TaskStore;

#[derive(Debug, Default)]
struct Tables {
    /// Insertion order doubles as creation order.
    tasks: Vec<Task>,
    containers: HashMap<Uuid, Container>,
    computings: HashMap<Uuid, Computing>,
    sys_conf: HashMap<Uuid, Value>,
    user_conf: HashMap<(Uuid, Uuid), Value>,
    keypairs: Vec<KeyPair>,
}

impl Tables {
    fn task_mut(&mut self, id: Uuid) -> Result<&mut Task> {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => Ok(task),
            None => bail!("task {id} not found"),
        }
    }
}

/// In-process [`TaskStore`]. A single lock guards every table, which makes
/// the tunnel-port claim atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_container(&self, container: Container) {
        self.tables().containers.insert(container.id, container);
    }

    pub fn add_computing(&self, computing: Computing) {
        self.tables().computings.insert(computing.id, computing);
    }

    pub fn set_sys_conf(&self, computing_id: Uuid, data: Value) {
        self.tables().sys_conf.insert(computing_id, data);
    }

    pub fn set_user_conf(&self, computing_id: Uuid, user: Uuid, data: Value) {
        self.tables().user_conf.insert((computing_id, user), data);
    }

    /// Add a key pair; a default one replaces the user's previous default.
    pub fn add_keypair(&self, keypair: KeyPair) {
        let mut tables = self.tables();
        if keypair.is_default {
            for kp in tables.keypairs.iter_mut().filter(|kp| kp.user_id == keypair.user_id) {
                kp.is_default = false;
            }
        }
        tables.keypairs.push(keypair);
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, new: &NewTask) -> Result<Task> {
        let task = Task {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            name: new.name.clone(),
            status: TaskStatus::Created,
            container_id: new.container_id,
            computing_id: new.computing_id,
            tid: None,
            pid: None,
            ip: None,
            port: new.port,
            tunnel_port: None,
            tunnel_pid: None,
            auth_user: new.auth_user.clone(),
            auth_pass: new.auth_pass.clone(),
            extra_binds: new.extra_binds.clone(),
            options: serde_json::to_value(&new.options)?,
            created_at: Utc::now(),
        };
        self.tables().tasks.push(task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tables().tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn list_tasks(&self, owner: Uuid) -> Result<Vec<Task>> {
        Ok(self
            .tables()
            .tasks
            .iter()
            .filter(|t| t.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn record_launch(&self, id: Uuid, launch: &Launch) -> Result<Task> {
        let mut tables = self.tables();
        let task = tables.task_mut(id)?;
        task.tid = launch.tid.clone();
        task.pid = launch.pid;
        if launch.ip.is_some() {
            task.ip = launch.ip.clone();
        }
        if launch.port.is_some() {
            task.port = launch.port;
        }
        if let Some(status) = launch.status {
            if task.status == TaskStatus::Created {
                task.status = status;
            }
        }
        Ok(task.clone())
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let mut tables = self.tables();
        let task = tables.task_mut(id)?;
        task.status = status;
        if status.is_terminal() {
            task.tunnel_port = None;
            task.tunnel_pid = None;
        }
        Ok(())
    }

    async fn set_address(&self, id: Uuid, ip: &str, port: i32) -> Result<bool> {
        let mut tables = self.tables();
        let Some(task) = tables.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(false);
        };
        task.ip = Some(ip.to_owned());
        task.port = Some(port);
        task.status = TaskStatus::Running;
        Ok(true)
    }

    async fn claim_tunnel_port(
        &self,
        id: Uuid,
        range: RangeInclusive<u16>,
    ) -> Result<Option<i32>> {
        let mut tables = self.tables();
        let held: Vec<i32> = tables
            .tasks
            .iter()
            .filter(|t| t.id != id && !t.status.is_terminal())
            .filter_map(|t| t.tunnel_port)
            .collect();

        let task = tables.task_mut(id)?;
        if task.tunnel_port.is_some() {
            return Ok(task.tunnel_port);
        }
        let free = range.map(i32::from).find(|p| !held.contains(p));
        task.tunnel_port = free;
        Ok(free)
    }

    async fn set_tunnel_pid(&self, id: Uuid, pid: Option<i32>) -> Result<()> {
        self.tables().task_mut(id)?.tunnel_pid = pid;
        Ok(())
    }

    async fn delete_terminal_task(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables();
        let before = tables.tasks.len();
        tables
            .tasks
            .retain(|t| !(t.id == id && t.status.is_terminal()));
        Ok(tables.tasks.len() < before)
    }

    async fn discard_task(&self, id: Uuid) -> Result<()> {
        self.tables().tasks.retain(|t| t.id != id);
        Ok(())
    }

    async fn get_container(&self, id: Uuid) -> Result<Option<Container>> {
        Ok(self.tables().containers.get(&id).cloned())
    }

    async fn get_computing(&self, id: Uuid) -> Result<Option<Computing>> {
        Ok(self.tables().computings.get(&id).cloned())
    }

    async fn get_sys_conf(&self, computing_id: Uuid) -> Result<Option<Value>> {
        Ok(self.tables().sys_conf.get(&computing_id).cloned())
    }

    async fn get_user_conf(&self, computing_id: Uuid, user: Uuid) -> Result<Option<Value>> {
        Ok(self.tables().user_conf.get(&(computing_id, user)).cloned())
    }

    async fn default_keypair(&self, user: Uuid) -> Result<Option<KeyPair>> {
        Ok(self
            .tables()
            .keypairs
            .iter()
            .find(|kp| kp.user_id == user && kp.is_default)
            .cloned())
    }
}
