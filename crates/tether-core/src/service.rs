//! Task service: the operations the CLI and HTTP surfaces call.
//!
//! Every operation takes the acting user; tasks, containers and computing
//! resources the user cannot see are reported as not found.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use tether_db::models::{ComputingOptions, Task, TaskStatus};
use tether_db::queries::tasks::NewTask;

use crate::driver::{Driver, DriverRegistry, TaskContext};
use crate::error::{Result, TetherError};
use crate::reconcile::Reconciler;
use crate::resource::ResourceConf;
use crate::settings::Settings;
use crate::shell::Shell;
use crate::store::TaskStore;
use crate::tunnel::{TunnelAllocator, TunnelEndpoint};

/// Minimum length of a task password.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Request to create a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub name: String,
    pub container_id: Uuid,
    pub computing_id: Uuid,
    pub port: Option<i32>,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    pub extra_binds: Option<String>,
    pub options: ComputingOptions,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    registry: Arc<DriverRegistry>,
    tunnels: Arc<TunnelAllocator>,
    reconciler: Reconciler,
}

impl TaskService {
    /// A service with the built-in drivers.
    pub fn new(store: Arc<dyn TaskStore>, shell: Arc<dyn Shell>, settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let registry = DriverRegistry::with_builtin(shell.clone(), settings.clone());
        Self::with_registry(store, shell, &settings, registry)
    }

    pub fn with_registry(
        store: Arc<dyn TaskStore>,
        shell: Arc<dyn Shell>,
        settings: &Settings,
        registry: DriverRegistry,
    ) -> Self {
        let tunnels = Arc::new(TunnelAllocator::new(
            shell,
            store.clone(),
            settings.tunnel.clone(),
        ));
        Self {
            reconciler: Reconciler::new(store.clone(), tunnels.clone()),
            store,
            registry: Arc::new(registry),
            tunnels,
        }
    }

    /// Persist a new task in status `created`.
    pub async fn create_task(&self, owner: Uuid, req: CreateTask) -> Result<Task> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(TetherError::Invalid("task name must not be empty".into()));
        }
        if let Some(pass) = &req.auth_pass {
            if pass.chars().count() < MIN_PASSWORD_LEN {
                return Err(TetherError::Invalid(format!(
                    "task password must be at least {MIN_PASSWORD_LEN} characters"
                )));
            }
        }

        let container = self
            .store
            .get_container(req.container_id)
            .await?
            .filter(|c| c.is_visible_to(owner))
            .ok_or_else(|| TetherError::not_found("container", req.container_id))?;
        let computing = self
            .store
            .get_computing(req.computing_id)
            .await?
            .filter(|c| c.is_visible_to(owner))
            .ok_or_else(|| TetherError::not_found("computing resource", req.computing_id))?;

        // Containers with a fixed port always get their default.
        let port = if container.supports_dynamic_ports {
            req.port.or_else(|| container.default_port())
        } else {
            container.default_port()
        };
        if let Some(p) = port {
            if !(1..=65535).contains(&p) {
                return Err(TetherError::Invalid(format!("port {p} out of range")));
            }
        }

        let task = self
            .store
            .insert_task(&NewTask {
                owner_id: owner,
                name: name.to_owned(),
                container_id: container.id,
                computing_id: computing.id,
                port,
                auth_user: req.auth_user.filter(|u| !u.trim().is_empty()),
                auth_pass: req.auth_pass,
                extra_binds: req.extra_binds.filter(|b| !b.trim().is_empty()),
                options: req.options,
            })
            .await?;
        info!(task_id = %task.id, %owner, container = %container.name, computing = %computing.name, "task created");
        Ok(task)
    }

    /// Launch a created task. If the launch fails the task is deleted and
    /// the error returned.
    pub async fn start_task(&self, owner: Uuid, id: Uuid) -> Result<Task> {
        let task = self.owned_task(owner, id).await?;
        if task.status != TaskStatus::Created {
            return Err(TetherError::InvalidState(format!(
                "task {id} is {}, only created tasks can be started",
                task.status
            )));
        }

        match self.launch(task).await {
            Ok(task) => {
                info!(task_id = %id, status = %task.status, "task started");
                Ok(task)
            }
            Err(err) => {
                error!(task_id = %id, error = %err, "task start failed, discarding task");
                if let Err(e) = self.store.discard_task(id).await {
                    warn!(task_id = %id, error = %e, "failed to discard task");
                }
                Err(err)
            }
        }
    }

    /// Run the driver and persist what it launched. Once the backend may
    /// hold a workload, any failure aborts it before returning.
    async fn launch(&self, task: Task) -> Result<Task> {
        let mut ctx = self.load_context(task).await?;
        ctx.check_ready()?;
        let driver = self.driver(&ctx)?;

        let started = driver.start(&ctx).await;
        let err = match started {
            Ok(launch) => {
                let recorded = self.store.record_launch(ctx.task.id, &launch).await;
                match recorded {
                    Ok(task) => return Ok(task),
                    Err(err) => {
                        ctx.task.tid = launch.tid;
                        ctx.task.pid = launch.pid;
                        TetherError::from(err)
                    }
                }
            }
            // Refused before any backend command ran.
            Err(err @ TetherError::Configuration(_)) => return Err(err),
            Err(err) => err,
        };

        if let Err(cleanup) = driver.abort(&ctx).await {
            warn!(task_id = %ctx.task.id, error = %cleanup, "failed to abort partial launch");
        }
        Err(err)
    }

    /// Create and start in one call.
    pub async fn launch_task(&self, owner: Uuid, req: CreateTask) -> Result<Task> {
        let task = self.create_task(owner, req).await?;
        self.start_task(owner, task.id).await
    }

    /// Stop the workload, tear its relay down and mark it stopped.
    pub async fn stop_task(&self, owner: Uuid, id: Uuid) -> Result<Task> {
        let task = self.owned_task(owner, id).await?;
        let ctx = self.load_context(task).await?;
        self.driver(&ctx)?.stop(&ctx).await?;
        self.mark_stopped(&ctx.task).await?;
        info!(task_id = %id, "task stopped");
        self.owned_task(owner, id).await
    }

    pub async fn fetch_log(&self, owner: Uuid, id: Uuid) -> Result<String> {
        let task = self.owned_task(owner, id).await?;
        let ctx = self.load_context(task).await?;
        self.driver(&ctx)?.fetch_log(&ctx).await
    }

    /// Delete a task. A task that is not yet terminal is stopped first; if
    /// that fails it is marked stopped anyway. Backend leftovers of a
    /// terminal task are released on a best-effort basis.
    pub async fn delete_task(&self, owner: Uuid, id: Uuid) -> Result<()> {
        let task = self.owned_task(owner, id).await?;
        if task.status.is_terminal() {
            self.release(task).await;
        } else if let Err(err) = self.stop_task(owner, id).await {
            warn!(task_id = %id, error = %err, "stop before delete failed, marking stopped");
            self.mark_stopped(&task).await?;
        }
        if !self.store.delete_terminal_task(id).await? {
            return Err(TetherError::InvalidState(format!(
                "task {id} is not stopped or exited"
            )));
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Expose the task on a local port.
    pub async fn connect(&self, owner: Uuid, id: Uuid) -> Result<TunnelEndpoint> {
        let task = self.owned_task(owner, id).await?;
        let ctx = self.load_context(task).await?;
        self.tunnels.connect(&ctx).await
    }

    /// Refresh the task's status from its backend.
    pub async fn update_status(&self, owner: Uuid, id: Uuid) -> Result<Task> {
        let task = self.owned_task(owner, id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        let ctx = self.load_context(task).await?;
        self.reconciler.reconcile(self.driver(&ctx)?, &ctx).await?;
        self.owned_task(owner, id).await
    }

    pub async fn get_task(&self, owner: Uuid, id: Uuid) -> Result<Task> {
        self.owned_task(owner, id).await
    }

    /// The owner's tasks, oldest first, with launched live tasks refreshed
    /// from their backends. Refresh failures are logged, not returned.
    pub async fn list_tasks(&self, owner: Uuid) -> Result<Vec<Task>> {
        let tasks = self.store.list_tasks(owner).await?;
        let mut refreshed = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.status.is_terminal() || task.tid.is_none() {
                refreshed.push(task);
                continue;
            }
            match self.update_status(owner, task.id).await {
                Ok(updated) => refreshed.push(updated),
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "status refresh failed");
                    refreshed.push(task);
                }
            }
        }
        Ok(refreshed)
    }

    async fn owned_task(&self, owner: Uuid, id: Uuid) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .filter(|t| t.owner_id == owner)
            .ok_or_else(|| TetherError::not_found("task", id))
    }

    async fn release(&self, task: Task) {
        let id = task.id;
        let released = async {
            let ctx = self.load_context(task).await?;
            self.driver(&ctx)?.release(&ctx).await
        }
        .await;
        if let Err(err) = released {
            warn!(task_id = %id, error = %err, "failed to release backend resources");
        }
    }

    async fn mark_stopped(&self, task: &Task) -> Result<()> {
        if let Err(e) = self.tunnels.stop(task).await {
            warn!(task_id = %task.id, error = %e, "failed to stop relay");
        }
        self.store.set_status(task.id, TaskStatus::Stopped).await?;
        Ok(())
    }

    async fn load_context(&self, task: Task) -> Result<TaskContext> {
        let container = self
            .store
            .get_container(task.container_id)
            .await?
            .ok_or_else(|| TetherError::not_found("container", task.container_id))?;
        let computing = self
            .store
            .get_computing(task.computing_id)
            .await?
            .ok_or_else(|| TetherError::not_found("computing resource", task.computing_id))?;

        let sys = self.store.get_sys_conf(computing.id).await?;
        let user = self.store.get_user_conf(computing.id, task.owner_id).await?;
        let conf = ResourceConf::attach(&computing, task.owner_id, sys, user)?;
        let keypair = if computing.requires_user_keys {
            self.store.default_keypair(task.owner_id).await?
        } else {
            None
        };

        Ok(TaskContext {
            task,
            container,
            computing,
            conf,
            keypair,
        })
    }

    fn driver(&self, ctx: &TaskContext) -> Result<&dyn Driver> {
        self.registry.get(ctx.computing.kind).ok_or_else(|| {
            TetherError::Configuration(format!(
                "no driver for {} computing resources",
                ctx.computing.kind
            ))
        })
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("registry", &self.registry)
            .field("tunnels", &self.tunnels)
            .finish_non_exhaustive()
    }
}
