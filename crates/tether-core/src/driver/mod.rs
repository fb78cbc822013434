//! Execution drivers: one per computing resource kind.
//!
//! A driver turns a [`TaskContext`] into backend command lines and runs
//! them through the [`Shell`](crate::shell::Shell) seam. Drivers never
//! touch the task store; the service persists what they return.

pub mod local;
pub mod registry;
pub mod remote;
pub mod remotehop;
mod singularity;
pub mod slurm;
pub(crate) mod ssh;

use async_trait::async_trait;

use tether_db::models::{
    Computing, ComputingKind, Container, ContainerRuntime, KeyPair, Task, TaskStatus,
};
use tether_db::queries::tasks::Launch;

use crate::error::{Result, TetherError};
use crate::resource::ResourceConf;

pub use local::LocalDriver;
pub use registry::DriverRegistry;
pub use remote::RemoteDriver;
pub use remotehop::RemoteHopDriver;
pub use slurm::SlurmDriver;

/// Everything a driver needs to act on one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub container: Container,
    pub computing: Computing,
    pub conf: ResourceConf,
    /// The task owner's default key pair, when the resource wants one.
    pub keypair: Option<KeyPair>,
}

impl TaskContext {
    /// Private key used for ssh: the owner's default key pair, else the
    /// conf `identity`.
    pub fn identity(&self) -> Result<String> {
        if let Some(kp) = &self.keypair {
            return Ok(kp.private_key_file.clone());
        }
        self.conf.param("identity").ok_or_else(|| {
            TetherError::Configuration(format!(
                "no key pair or identity available for computing resource {}",
                self.computing.name
            ))
        })
    }

    /// Check the resource declares everything it requires before a launch.
    pub fn check_ready(&self) -> Result<()> {
        let name = &self.computing.name;
        if self.computing.requires_sys_conf && self.conf.sys().is_none() {
            return Err(TetherError::Configuration(format!(
                "computing resource {name} has no resource-level conf"
            )));
        }
        if self.computing.requires_user_conf && self.conf.user().is_none() {
            return Err(TetherError::Configuration(format!(
                "no user conf for computing resource {name}"
            )));
        }
        if self.computing.requires_user_keys && self.keypair.is_none() {
            return Err(TetherError::Configuration(format!(
                "computing resource {name} needs a default key pair"
            )));
        }
        Ok(())
    }

    /// Refuse containers whose runtime the resource cannot run.
    pub fn check_runtime(&self, wanted: ContainerRuntime) -> Result<()> {
        let supported = match wanted {
            ContainerRuntime::Docker => self.computing.supports_docker,
            ContainerRuntime::Singularity => self.computing.supports_singularity,
        };
        if self.container.runtime != wanted || !supported {
            return Err(TetherError::Configuration(format!(
                "{} containers cannot run on {} computing resource {}",
                self.container.runtime, self.computing.kind, self.computing.name
            )));
        }
        Ok(())
    }

    /// The port a fixed-port launch binds: the task's own, else the
    /// container default.
    pub fn fixed_port(&self) -> Result<i32> {
        self.task
            .port
            .or_else(|| self.container.default_port())
            .ok_or_else(|| {
                TetherError::Configuration(format!(
                    "container {} declares no port",
                    self.container.name
                ))
            })
    }
}

/// Starts, stops, and inspects workloads on one kind of backend.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> ComputingKind;

    /// Launch the workload. The returned [`Launch`] is persisted as-is.
    async fn start(&self, ctx: &TaskContext) -> Result<Launch>;

    /// Tear the workload down. A workload that is already gone is not an
    /// error.
    async fn stop(&self, ctx: &TaskContext) -> Result<()>;

    /// Undo a start that failed part way. `ctx.task` carries whatever
    /// handle the start produced, possibly none. Defaults to
    /// [`Driver::stop`].
    async fn abort(&self, ctx: &TaskContext) -> Result<()> {
        self.stop(ctx).await
    }

    /// Free what an ended workload still holds on the backend.
    async fn release(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    async fn fetch_log(&self, ctx: &TaskContext) -> Result<String>;

    /// Ask the backend what state the workload is in. `None` means no
    /// information or no change worth recording.
    async fn probe(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Driver) {}
};

/// Whether a failed command only says its target no longer exists.
fn already_gone(stderr: &str, marker: &str) -> bool {
    stderr.to_ascii_lowercase().contains(&marker.to_ascii_lowercase())
}

fn not_started(task: &Task) -> TetherError {
    TetherError::InvalidState(format!("task {} has not been started", task.id))
}

/// Parse the last line of `stdout` as a numeric id.
fn parse_numeric_id(stdout: &str, what: &str) -> Result<i64> {
    let last = stdout.lines().map(str::trim).rfind(|l| !l.is_empty()).unwrap_or("");
    last.parse()
        .map_err(|_| TetherError::Protocol(format!("expected a {what}, got {stdout:?}")))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use serde_json::{Value, json};
    use uuid::Uuid;

    use tether_db::models::{Registry, TaskStatus};

    use super::*;

    pub fn container(runtime: ContainerRuntime) -> Container {
        Container {
            id: Uuid::new_v4(),
            owner_id: None,
            name: "jupyter".into(),
            image: "demo/jupyter".into(),
            runtime,
            registry: Registry::DockerHub,
            ports: Some("8888,8889".into()),
            supports_dynamic_ports: true,
            supports_user_auth: false,
            supports_pass_auth: true,
            created_at: Utc::now(),
        }
    }

    pub fn computing(kind: ComputingKind) -> Computing {
        let remote = kind != ComputingKind::Local;
        Computing {
            id: Uuid::new_v4(),
            owner_id: None,
            name: format!("{kind}-resource"),
            kind,
            requires_sys_conf: remote,
            requires_user_conf: remote,
            requires_user_keys: remote,
            supports_docker: !remote,
            supports_singularity: remote,
            created_at: Utc::now(),
        }
    }

    pub fn task(container: &Container, computing: &Computing) -> Task {
        Task {
            id: Uuid::parse_str("6f1c2a9e-3b7d-4c55-9a0e-1d2f3a4b5c6d").unwrap(),
            owner_id: Uuid::new_v4(),
            name: "notebook".into(),
            status: TaskStatus::Created,
            container_id: container.id,
            computing_id: computing.id,
            tid: None,
            pid: None,
            ip: None,
            port: None,
            tunnel_port: None,
            tunnel_pid: None,
            auth_user: None,
            auth_pass: None,
            extra_binds: None,
            options: json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn keypair(user: Uuid) -> KeyPair {
        KeyPair {
            id: Uuid::new_v4(),
            user_id: user,
            private_key_file: "/keys/id_rsa".into(),
            public_key_file: "/keys/id_rsa.pub".into(),
            is_default: true,
            created_at: Utc::now(),
        }
    }

    /// A ready context for `kind` with the given resource-level conf.
    pub fn context(kind: ComputingKind, sys: Value) -> TaskContext {
        let runtime = if kind == ComputingKind::Local {
            ContainerRuntime::Docker
        } else {
            ContainerRuntime::Singularity
        };
        let container = container(runtime);
        let computing = computing(kind);
        let task = task(&container, &computing);
        let keypair = (kind != ComputingKind::Local).then(|| keypair(task.owner_id));
        TaskContext {
            conf: ResourceConf::new(Some(sys), Some(json!({}))),
            task,
            container,
            computing,
            keypair,
        }
    }
}
