//! Singularity on a single host reached over ssh.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use tether_db::models::{ComputingKind, ContainerRuntime, TaskStatus};
use tether_db::queries::tasks::Launch;

use super::singularity::{PortSource, SingularityLaunch, data_dir, image_ref};
use super::ssh::SshTarget;
use super::{Driver, TaskContext, already_gone, not_started, parse_numeric_id};
use crate::agent::bootstrap_url;
use crate::error::Result;
use crate::resource::binds_for;
use crate::settings::Settings;
use crate::shell::{Shell, ShellCommand, shell_quote};

pub(crate) const NO_SUCH_PROCESS: &str = "No such process";

/// Launches detached singularity containers that report their address
/// through the agent callback.
pub struct RemoteDriver {
    shell: Arc<dyn Shell>,
    settings: Arc<Settings>,
}

impl RemoteDriver {
    pub fn new(shell: Arc<dyn Shell>, settings: Arc<Settings>) -> Self {
        Self { shell, settings }
    }

    fn target(ctx: &TaskContext) -> Result<SshTarget> {
        Ok(SshTarget::new(
            ctx.conf.require("user")?,
            ctx.conf.require("host")?,
            Some(ctx.identity()?),
        ))
    }

    fn launch(&self, ctx: &TaskContext) -> SingularityLaunch {
        let task = &ctx.task;
        SingularityLaunch {
            task_id: task.id,
            image: image_ref(
                ctx.container.registry,
                &self.settings.remote_registry,
                &ctx.container.image,
            ),
            binds: binds_for(&ctx.conf, &ctx.computing, task.owner_id, task.extra_binds.as_deref()),
            auth_pass: task.auth_pass.clone(),
            port: PortSource::Agent {
                bootstrap_url: bootstrap_url(&self.settings, task.id),
            },
            setup_command: ctx.conf.param("setup_command"),
            log_path: log_path(task.id),
        }
    }
}

fn log_path(task_id: uuid::Uuid) -> String {
    format!("{}/task.log", data_dir(task_id))
}

/// Liveness of a remote pid via `kill -0`: `Some(Exited)` once the process
/// is gone, `None` while it runs.
pub(crate) async fn probe_pid(shell: &dyn Shell, cmd: &ShellCommand) -> Result<Option<TaskStatus>> {
    let output = shell.run(cmd).await?;
    if output.success() {
        return Ok(None);
    }
    if already_gone(&output.stderr, NO_SUCH_PROCESS) {
        return Ok(Some(TaskStatus::Exited));
    }
    output.check(cmd).map(|_| None)
}

/// `kill -9`, where a process that no longer exists counts as stopped.
pub(crate) async fn kill_pid(shell: &dyn Shell, cmd: &ShellCommand) -> Result<()> {
    let output = shell.run(cmd).await?;
    if output.success() || already_gone(&output.stderr, NO_SUCH_PROCESS) {
        return Ok(());
    }
    output.check(cmd).map(drop)
}

/// `pkill` for anything still running out of the task's data directory.
/// The bracket keeps the pattern from matching the command line that
/// carries it.
pub(crate) fn pkill_task(task_id: uuid::Uuid) -> String {
    let dir = data_dir(task_id);
    let pattern = format!("[/]{}", dir.trim_start_matches('/'));
    format!("pkill -9 -f {}", shell_quote(&pattern))
}

/// Run [`pkill_task`]. Exit status 1 means nothing matched.
pub(crate) async fn kill_task_processes(shell: &dyn Shell, cmd: &ShellCommand) -> Result<()> {
    let output = shell.run(cmd).await?;
    if output.success() || output.exit_code == Some(1) {
        return Ok(());
    }
    output.check(cmd).map(drop)
}

#[async_trait]
impl Driver for RemoteDriver {
    fn kind(&self) -> ComputingKind {
        ComputingKind::Remote
    }

    async fn start(&self, ctx: &TaskContext) -> Result<Launch> {
        ctx.check_runtime(ContainerRuntime::Singularity)?;
        let target = Self::target(ctx)?;
        let script = self.launch(ctx).detached_script()?;

        let stdout = self.shell.run_checked(&target.command(&script)).await?;
        let pid = parse_numeric_id(&stdout, "pid from the remote launch")?;

        info!(task_id = %ctx.task.id, host = %target.host, pid, "launched remote task");
        Ok(Launch {
            tid: Some(ctx.task.id.to_string()),
            pid: Some(pid),
            ..Launch::default()
        })
    }

    async fn stop(&self, ctx: &TaskContext) -> Result<()> {
        let Some(pid) = ctx.task.pid else {
            return Ok(());
        };
        let target = Self::target(ctx)?;
        kill_pid(self.shell.as_ref(), &target.command(&format!("kill -9 {pid}"))).await
    }

    async fn abort(&self, ctx: &TaskContext) -> Result<()> {
        if ctx.task.pid.is_some() {
            return self.stop(ctx).await;
        }
        let target = Self::target(ctx)?;
        kill_task_processes(self.shell.as_ref(), &target.command(&pkill_task(ctx.task.id))).await
    }

    async fn fetch_log(&self, ctx: &TaskContext) -> Result<String> {
        if ctx.task.tid.is_none() {
            return Err(not_started(&ctx.task));
        }
        let target = Self::target(ctx)?;
        let cmd = target.command(&format!("cat {}", log_path(ctx.task.id)));
        self.shell.run_checked(&cmd).await
    }

    async fn probe(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        let Some(pid) = ctx.task.pid else {
            return Ok(None);
        };
        let target = Self::target(ctx)?;
        probe_pid(self.shell.as_ref(), &target.command(&format!("kill -0 {pid}"))).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::driver::fixtures::context;
    use crate::error::TetherError;
    use crate::shell::{MockShell, ShellOutput};

    fn driver() -> (Arc<MockShell>, RemoteDriver) {
        let shell = Arc::new(MockShell::new());
        let settings = Settings {
            callback_url: "http://orchestrator:8080".into(),
            ..Settings::default()
        };
        (shell.clone(), RemoteDriver::new(shell, Arc::new(settings)))
    }

    fn remote_ctx() -> TaskContext {
        context(
            ComputingKind::Remote,
            json!({"host": "h.example.org", "user": "alice", "binds": "/shared:/shared"}),
        )
    }

    #[tokio::test]
    async fn start_returns_remote_pid_and_leaves_status_alone() {
        let (shell, driver) = driver();
        shell.respond("ssh", ShellOutput::ok("31337"));
        let ctx = remote_ctx();

        let launch = driver.start(&ctx).await.unwrap();
        assert_eq!(launch.tid, Some(ctx.task.id.to_string()));
        assert_eq!(launch.pid, Some(31337));
        assert_eq!(launch.status, None, "the agent callback marks it running");
        assert_eq!(launch.ip, None);

        let cmd = &shell.runs()[0];
        assert_eq!(cmd.args[..2], ["-i".to_owned(), "/keys/id_rsa".to_owned()]);
        assert!(cmd.args.contains(&"alice@h.example.org".to_owned()));
        let remote = cmd.last_arg().unwrap();
        assert!(remote.starts_with("bash -c "), "{remote}");
        assert!(remote.contains(&format!("task_id={}&action=bootstrap", ctx.task.id)), "{remote}");
        assert!(remote.contains("/shared:/shared"), "{remote}");
    }

    #[tokio::test]
    async fn garbage_instead_of_pid_is_a_protocol_error() {
        let (shell, driver) = driver();
        shell.respond("ssh", ShellOutput::ok("bash: singularity: command not found"));
        assert!(matches!(driver.start(&remote_ctx()).await, Err(TetherError::Protocol(_))));
    }

    #[tokio::test]
    async fn abort_without_pid_kills_by_data_dir() {
        let (shell, driver) = driver();
        let ctx = remote_ctx();
        shell.respond("pkill", ShellOutput::failed(1, ""));

        driver.abort(&ctx).await.unwrap();
        let line = shell.runs()[0].last_arg().unwrap().to_owned();
        assert!(line.contains(&format!("pkill -9 -f '\\''[/]tmp/{}_data'\\''", ctx.task.id)), "{line}");

        shell.respond("pkill", ShellOutput::failed(255, "ssh: connect to host h.example.org port 22: Connection refused"));
        assert!(matches!(driver.abort(&ctx).await, Err(TetherError::Execution { .. })));
    }

    #[tokio::test]
    async fn missing_host_fails_before_ssh() {
        let (shell, driver) = driver();
        let ctx = context(ComputingKind::Remote, json!({"user": "alice"}));
        assert!(matches!(
            driver.start(&ctx).await,
            Err(TetherError::Configuration(m)) if m == "missing host in conf"
        ));
        assert!(shell.runs().is_empty());
    }

    #[tokio::test]
    async fn stop_kills_pid_and_tolerates_vanished_process() {
        let (shell, driver) = driver();
        let mut ctx = remote_ctx();
        driver.stop(&ctx).await.unwrap();
        assert!(shell.runs().is_empty(), "never launched, nothing to kill");

        ctx.task.pid = Some(4242);
        shell.respond("kill -9", ShellOutput::failed(1, "bash: line 1: kill: (4242) - No such process"));
        driver.stop(&ctx).await.unwrap();
        assert!(shell.runs()[0].last_arg().unwrap().contains("kill -9 4242"));
    }

    #[tokio::test]
    async fn probe_reports_exit_once_pid_is_gone() {
        let (shell, driver) = driver();
        let mut ctx = remote_ctx();
        ctx.task.pid = Some(4242);

        assert_eq!(driver.probe(&ctx).await.unwrap(), None);
        shell.respond("kill -0", ShellOutput::failed(1, "kill: (4242) - No such process"));
        assert_eq!(driver.probe(&ctx).await.unwrap(), Some(TaskStatus::Exited));
        shell.respond("kill -0", ShellOutput::failed(255, "ssh: connect to host h.example.org port 22: Connection refused"));
        assert!(matches!(driver.probe(&ctx).await, Err(TetherError::Execution { .. })));
    }

    #[tokio::test]
    async fn log_reads_task_log() {
        let (shell, driver) = driver();
        shell.respond("cat /tmp/", ShellOutput::ok("listening on 50123"));
        let mut ctx = remote_ctx();
        ctx.task.tid = Some(ctx.task.id.to_string());

        assert_eq!(driver.fetch_log(&ctx).await.unwrap(), "listening on 50123");
        let line = shell.runs()[0].last_arg().unwrap().to_owned();
        assert!(line.contains(&format!("/tmp/{}_data/task.log", ctx.task.id)));
    }
}
