//! Singularity on a host reachable only through a gateway.
//!
//! No agent runs here: the container binds the task's fixed port and the
//! second host's name is its address.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use tether_db::models::{ComputingKind, ContainerRuntime, Registry, TaskStatus};
use tether_db::queries::tasks::Launch;

use super::remote::{kill_pid, kill_task_processes, pkill_task, probe_pid};
use super::singularity::{PortSource, SingularityLaunch, image_ref};
use super::ssh::SshTarget;
use super::{Driver, TaskContext, not_started, parse_numeric_id};
use crate::error::{Result, TetherError};
use crate::resource::binds_for;
use crate::settings::Settings;
use crate::shell::Shell;

pub struct RemoteHopDriver {
    shell: Arc<dyn Shell>,
    settings: Arc<Settings>,
}

/// The gateway and the host behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hops {
    pub first: SshTarget,
    pub second: SshTarget,
}

impl Hops {
    pub fn from_context(ctx: &TaskContext) -> Result<Self> {
        Ok(Self {
            first: SshTarget::new(
                ctx.conf.require("first_user")?,
                ctx.conf.require("first_host")?,
                Some(ctx.identity()?),
            ),
            second: SshTarget::new(
                ctx.conf.require("second_user")?,
                ctx.conf.require("second_host")?,
                None,
            ),
        })
    }

    fn command(&self, script: &str) -> crate::shell::ShellCommand {
        self.first.command_via(&self.second, script)
    }
}

impl RemoteHopDriver {
    pub fn new(shell: Arc<dyn Shell>, settings: Arc<Settings>) -> Self {
        Self { shell, settings }
    }
}

fn log_path(ctx: &TaskContext) -> String {
    format!("$HOME/{}.log", ctx.task.id)
}

#[async_trait]
impl Driver for RemoteHopDriver {
    fn kind(&self) -> ComputingKind {
        ComputingKind::RemoteHop
    }

    async fn start(&self, ctx: &TaskContext) -> Result<Launch> {
        ctx.check_runtime(ContainerRuntime::Singularity)?;
        if ctx.container.registry == Registry::DockerLocal {
            return Err(TetherError::Configuration(format!(
                "the private registry is not reachable from {} computing resources",
                ComputingKind::RemoteHop
            )));
        }
        let hops = Hops::from_context(ctx)?;
        let port = ctx.fixed_port()?;

        let task = &ctx.task;
        let script = SingularityLaunch {
            task_id: task.id,
            image: image_ref(
                ctx.container.registry,
                &self.settings.remote_registry,
                &ctx.container.image,
            ),
            binds: binds_for(&ctx.conf, &ctx.computing, task.owner_id, task.extra_binds.as_deref()),
            auth_pass: task.auth_pass.clone(),
            port: PortSource::Fixed(port),
            setup_command: ctx.conf.param("setup_command"),
            log_path: log_path(ctx),
        }
        .detached_script()?;

        let stdout = self.shell.run_checked(&hops.command(&script)).await?;
        let pid = parse_numeric_id(&stdout, "pid from the remote launch")?;

        info!(
            task_id = %task.id,
            gateway = %hops.first.host,
            host = %hops.second.host,
            pid,
            port,
            "launched double-hop task"
        );
        Ok(Launch {
            tid: Some(task.id.to_string()),
            pid: Some(pid),
            ip: Some(hops.second.host),
            port: Some(port),
            status: Some(TaskStatus::Running),
        })
    }

    async fn stop(&self, ctx: &TaskContext) -> Result<()> {
        let Some(pid) = ctx.task.pid else {
            return Ok(());
        };
        let hops = Hops::from_context(ctx)?;
        kill_pid(self.shell.as_ref(), &hops.command(&format!("kill -9 {pid}"))).await
    }

    async fn abort(&self, ctx: &TaskContext) -> Result<()> {
        if ctx.task.pid.is_some() {
            return self.stop(ctx).await;
        }
        let hops = Hops::from_context(ctx)?;
        kill_task_processes(self.shell.as_ref(), &hops.command(&pkill_task(ctx.task.id))).await
    }

    async fn fetch_log(&self, ctx: &TaskContext) -> Result<String> {
        if ctx.task.tid.is_none() {
            return Err(not_started(&ctx.task));
        }
        let hops = Hops::from_context(ctx)?;
        self.shell
            .run_checked(&hops.command(&format!("cat {}", log_path(ctx))))
            .await
    }

    async fn probe(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        let Some(pid) = ctx.task.pid else {
            return Ok(None);
        };
        let hops = Hops::from_context(ctx)?;
        probe_pid(self.shell.as_ref(), &hops.command(&format!("kill -0 {pid}"))).await
    }
}
