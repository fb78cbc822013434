//! Docker on the orchestrator's own host.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use tether_db::models::{ComputingKind, ContainerRuntime, Registry, TaskStatus};
use tether_db::queries::tasks::Launch;

use super::{Driver, TaskContext, already_gone, not_started};
use crate::error::{Result, TetherError};
use crate::settings::LocalSettings;
use crate::shell::{Shell, ShellCommand};

const NO_SUCH_CONTAINER: &str = "No such container";

/// Runs tasks as detached docker containers on a shared network.
pub struct LocalDriver {
    shell: Arc<dyn Shell>,
    settings: LocalSettings,
}

impl LocalDriver {
    pub fn new(shell: Arc<dyn Shell>, settings: LocalSettings) -> Self {
        Self { shell, settings }
    }

    fn docker(&self) -> ShellCommand {
        ShellCommand::new(&self.settings.docker)
    }

    fn image(&self, ctx: &TaskContext) -> String {
        match ctx.container.registry {
            Registry::DockerLocal => format!("{}/{}", self.settings.registry, ctx.container.image),
            Registry::DockerHub => ctx.container.image.clone(),
        }
    }

    fn run_command(&self, ctx: &TaskContext) -> ShellCommand {
        let id = ctx.task.id;
        let mut cmd = self.docker().args([
            "run".to_owned(),
            format!("--network={}", self.settings.network),
            "--name".to_owned(),
            container_name(ctx),
        ]);
        if let Some(pass) = &ctx.task.auth_pass {
            cmd = cmd.arg("-e").arg(format!("AUTH_PASS={pass}"));
        }
        if let Some(user) = ctx.task.auth_user.as_ref().filter(|_| ctx.container.supports_user_auth) {
            cmd = cmd.arg("-e").arg(format!("AUTH_USER={user}"));
        }
        cmd.args([
            "-v".to_owned(),
            format!("{}/task-{id}:/data", self.settings.data_dir.trim_end_matches('/')),
            "-h".to_owned(),
            format!("task-{id}"),
            "-d".to_owned(),
            "-t".to_owned(),
            self.image(ctx),
        ])
    }

    async fn address_of(&self, tid: &str) -> Result<String> {
        let inspect = self.docker().args([
            "inspect",
            "--format",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            tid,
        ]);
        let stdout = self.shell.run_checked(&inspect).await?;
        stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| TetherError::Protocol(format!("docker reported no address for {tid}")))
    }

    /// `docker <verb> <tid>`, where a missing container counts as done.
    async fn remove_step(&self, verb: &str, tid: &str) -> Result<()> {
        let cmd = self.docker().args([verb, tid]);
        let output = self.shell.run(&cmd).await?;
        if output.success() || already_gone(&output.stderr, NO_SUCH_CONTAINER) {
            return Ok(());
        }
        output.check(&cmd).map(drop)
    }
}

/// Container name for a task.
pub fn container_name(ctx: &TaskContext) -> String {
    format!("tether-task-{}", ctx.task.id)
}

#[async_trait]
impl Driver for LocalDriver {
    fn kind(&self) -> ComputingKind {
        ComputingKind::Local
    }

    async fn start(&self, ctx: &TaskContext) -> Result<Launch> {
        ctx.check_runtime(ContainerRuntime::Docker)?;
        let port = ctx.fixed_port()?;

        let stdout = self.shell.run_checked(&self.run_command(ctx)).await?;
        let tid = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| TetherError::Protocol("docker run printed no container id".into()))?;

        let ip = match self.address_of(&tid).await {
            Ok(ip) => ip,
            Err(err) => {
                // The record is about to be discarded; do not leave the
                // container behind.
                if let Err(cleanup) = self.remove_step("rm", &tid).await {
                    warn!(task_id = %ctx.task.id, %tid, error = %cleanup, "failed to remove container");
                }
                return Err(err);
            }
        };

        info!(task_id = %ctx.task.id, %tid, %ip, port, "started local container");
        Ok(Launch {
            tid: Some(tid),
            pid: None,
            ip: Some(ip),
            port: Some(port),
            status: Some(TaskStatus::Running),
        })
    }

    async fn stop(&self, ctx: &TaskContext) -> Result<()> {
        let Some(tid) = ctx.task.tid.as_deref() else {
            debug!(task_id = %ctx.task.id, "no container to stop");
            return Ok(());
        };
        self.remove_step("stop", tid).await?;
        self.remove_step("rm", tid).await
    }

    /// `docker run` may have created the container before failing, so
    /// fall back to its name.
    async fn abort(&self, ctx: &TaskContext) -> Result<()> {
        let target = ctx.task.tid.clone().unwrap_or_else(|| container_name(ctx));
        self.remove_step("stop", &target).await?;
        self.remove_step("rm", &target).await
    }

    async fn release(&self, ctx: &TaskContext) -> Result<()> {
        match ctx.task.tid.as_deref() {
            Some(tid) => self.remove_step("rm", tid).await,
            None => Ok(()),
        }
    }

    async fn fetch_log(&self, ctx: &TaskContext) -> Result<String> {
        let tid = ctx.task.tid.as_deref().ok_or_else(|| not_started(&ctx.task))?;
        let cmd = self.docker().args(["logs", tid]);
        let output = self.shell.run(&cmd).await?.check(&cmd)?;
        // The container's stderr arrives on ours.
        Ok(match (output.stdout.is_empty(), output.stderr.is_empty()) {
            (_, true) => output.stdout,
            (true, false) => output.stderr,
            (false, false) => format!("{}\n{}", output.stdout, output.stderr),
        })
    }

    async fn probe(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        let Some(tid) = ctx.task.tid.as_deref() else {
            return Ok(None);
        };
        let cmd = self.docker().args(["inspect", "--format", "{{.State.Status}}", tid]);
        let output = self.shell.run(&cmd).await?;
        if !output.success()
            && (already_gone(&output.stderr, NO_SUCH_CONTAINER)
                || already_gone(&output.stderr, "No such object"))
        {
            return Ok(Some(TaskStatus::Exited));
        }
        let output = output.check(&cmd)?;

        Ok(match output.stdout.trim() {
            "running" => Some(TaskStatus::Running),
            "exited" | "dead" => Some(TaskStatus::Exited),
            other => {
                warn!(task_id = %ctx.task.id, state = other, "unhandled docker state");
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::driver::fixtures::context;
    use crate::shell::{MockShell, ShellOutput};

    fn driver() -> (Arc<MockShell>, LocalDriver) {
        let shell = Arc::new(MockShell::new());
        let driver = LocalDriver::new(shell.clone(), LocalSettings::default());
        (shell, driver)
    }

    fn local_ctx() -> TaskContext {
        context(ComputingKind::Local, json!({}))
    }

    #[tokio::test]
    async fn start_runs_container_and_reads_address() {
        let (shell, driver) = driver();
        shell.respond("docker run", ShellOutput::ok("abc123\n"));
        shell.respond("docker inspect", ShellOutput::ok("10.0.0.5"));

        let mut ctx = local_ctx();
        ctx.task.auth_pass = Some("s3cret!".into());
        let launch = driver.start(&ctx).await.unwrap();

        assert_eq!(
            launch,
            Launch {
                tid: Some("abc123".into()),
                pid: None,
                ip: Some("10.0.0.5".into()),
                port: Some(8888),
                status: Some(TaskStatus::Running),
            }
        );

        let id = ctx.task.id;
        let runs = shell.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(
            runs[0].args,
            vec![
                "run".to_owned(),
                "--network=tether_default".into(),
                "--name".into(),
                format!("tether-task-{id}"),
                "-e".into(),
                "AUTH_PASS=s3cret!".into(),
                "-v".into(),
                format!("/data/task-{id}:/data"),
                "-h".into(),
                format!("task-{id}"),
                "-d".into(),
                "-t".into(),
                "demo/jupyter".into(),
            ]
        );
        assert_eq!(runs[1].last_arg(), Some("abc123"));
    }

    #[tokio::test]
    async fn private_registry_prefixes_the_image() {
        let (shell, driver) = driver();
        shell.respond("docker run", ShellOutput::ok("abc"));
        shell.respond("docker inspect", ShellOutput::ok("10.0.0.9"));
        let mut ctx = local_ctx();
        ctx.container.registry = Registry::DockerLocal;

        driver.start(&ctx).await.unwrap();
        assert_eq!(shell.runs()[0].last_arg(), Some("localhost:5000/demo/jupyter"));
    }

    #[tokio::test]
    async fn failed_run_surfaces_stderr() {
        let (shell, driver) = driver();
        shell.respond("docker run", ShellOutput::failed(125, "Unable to find image"));

        let err = driver.start(&local_ctx()).await.unwrap_err();
        assert!(
            matches!(&err, TetherError::Execution { stderr, .. } if stderr == "Unable to find image"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn missing_address_removes_the_container() {
        let (shell, driver) = driver();
        shell.respond("docker run", ShellOutput::ok("abc"));
        shell.respond("docker inspect", ShellOutput::ok(""));

        let err = driver.start(&local_ctx()).await.unwrap_err();
        assert!(matches!(err, TetherError::Protocol(_)));
        assert_eq!(shell.run_lines().last().unwrap(), "docker rm abc");
    }

    #[tokio::test]
    async fn singularity_container_is_refused_before_any_command() {
        let (shell, driver) = driver();
        let mut ctx = local_ctx();
        ctx.container.runtime = ContainerRuntime::Singularity;
        assert!(matches!(driver.start(&ctx).await, Err(TetherError::Configuration(_))));
        assert!(shell.runs().is_empty());
    }

    #[tokio::test]
    async fn stop_tolerates_vanished_container() {
        let (shell, driver) = driver();
        shell.respond("docker stop", ShellOutput::failed(1, "Error: No such container: abc"));
        shell.respond("docker rm", ShellOutput::failed(1, "Error: No such container: abc"));
        let mut ctx = local_ctx();
        ctx.task.tid = Some("abc".into());

        driver.stop(&ctx).await.unwrap();
        assert_eq!(shell.run_lines(), vec!["docker stop abc", "docker rm abc"]);
    }

    #[tokio::test]
    async fn stop_propagates_other_failures() {
        let (shell, driver) = driver();
        shell.respond("docker stop", ShellOutput::failed(1, "Cannot connect to the Docker daemon"));
        let mut ctx = local_ctx();
        ctx.task.tid = Some("abc".into());

        assert!(matches!(driver.stop(&ctx).await, Err(TetherError::Execution { .. })));
    }

    #[tokio::test]
    async fn abort_falls_back_to_the_container_name() {
        let (shell, driver) = driver();
        shell.respond("docker stop", ShellOutput::failed(1, "Error: No such container"));
        let mut ctx = local_ctx();
        let name = format!("tether-task-{}", ctx.task.id);

        driver.abort(&ctx).await.unwrap();
        assert_eq!(shell.run_lines(), vec![format!("docker stop {name}"), format!("docker rm {name}")]);

        ctx.task.tid = Some("abc".into());
        driver.abort(&ctx).await.unwrap();
        assert_eq!(shell.run_lines()[2..], ["docker stop abc", "docker rm abc"]);
    }

    #[tokio::test]
    async fn release_removes_an_exited_container() {
        let (shell, driver) = driver();
        let mut ctx = local_ctx();
        driver.release(&ctx).await.unwrap();
        assert!(shell.runs().is_empty());

        ctx.task.tid = Some("abc".into());
        shell.respond("docker rm", ShellOutput::failed(1, "Error: No such container: abc"));
        driver.release(&ctx).await.unwrap();
        assert_eq!(shell.run_lines(), vec!["docker rm abc"]);
    }

    #[tokio::test]
    async fn probe_maps_docker_states() {
        let (shell, driver) = driver();
        let mut ctx = local_ctx();
        assert_eq!(driver.probe(&ctx).await.unwrap(), None, "no tid, nothing to ask");

        ctx.task.tid = Some("abc".into());
        for (state, expected) in [
            ("running", Some(TaskStatus::Running)),
            ("exited", Some(TaskStatus::Exited)),
            ("paused", None),
        ] {
            shell.respond("{{.State.Status}}", ShellOutput::ok(state));
            assert_eq!(driver.probe(&ctx).await.unwrap(), expected, "{state}");
        }

        shell.respond("{{.State.Status}}", ShellOutput::failed(1, "Error: No such object: abc"));
        assert_eq!(driver.probe(&ctx).await.unwrap(), Some(TaskStatus::Exited));
    }

    #[tokio::test]
    async fn log_needs_a_started_task() {
        let (shell, driver) = driver();
        let mut ctx = local_ctx();
        assert!(matches!(driver.fetch_log(&ctx).await, Err(TetherError::InvalidState(_))));

        ctx.task.tid = Some("abc".into());
        shell.respond("docker logs", ShellOutput {
            exit_code: Some(0),
            stdout: "server up".into(),
            stderr: "warning: x".into(),
        });
        assert_eq!(driver.fetch_log(&ctx).await.unwrap(), "server up\nwarning: x");
    }

    #[tokio::test]
    async fn inspect_timeout_is_distinct() {
        let (shell, driver) = driver();
        shell.time_out("docker inspect");
        let mut ctx = local_ctx();
        ctx.task.tid = Some("abc".into());
        assert!(matches!(driver.probe(&ctx).await, Err(TetherError::TimedOut { .. })));
    }
}
