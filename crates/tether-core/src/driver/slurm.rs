//! Batch jobs on a slurm cluster, submitted over ssh to the master.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tether_db::models::{ComputingKind, ContainerRuntime, TaskStatus};
use tether_db::queries::tasks::Launch;

use super::singularity::{PortSource, SingularityLaunch, image_ref};
use super::ssh::SshTarget;
use super::{Driver, TaskContext, already_gone, not_started};
use crate::agent::bootstrap_url;
use crate::error::{Result, TetherError};
use crate::resource::binds_for;
use crate::settings::Settings;
use crate::shell::{Shell, shell_quote};

const INVALID_JOB_ID: &str = "Invalid job id";
const SUBMITTED: &str = "Submitted batch job";

/// Job states after which the job will not run again.
const FINISHED_STATES: &[&str] = &[
    "BOOT_FAIL",
    "CANCELLED",
    "COMPLETED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "TIMEOUT",
];

pub struct SlurmDriver {
    shell: Arc<dyn Shell>,
    settings: Arc<Settings>,
}

impl SlurmDriver {
    pub fn new(shell: Arc<dyn Shell>, settings: Arc<Settings>) -> Self {
        Self { shell, settings }
    }

    fn target(ctx: &TaskContext) -> Result<SshTarget> {
        let host = ctx
            .conf
            .param("master")
            .or_else(|| ctx.conf.param("host"))
            .ok_or_else(|| TetherError::Configuration("missing host in conf".to_owned()))?;
        Ok(SshTarget::new(ctx.conf.require("user")?, host, Some(ctx.identity()?)))
    }

    fn job_script(&self, ctx: &TaskContext) -> Result<String> {
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
            log_path: log_path(ctx),
        }
        .job_script()
    }

    /// `sbatch` flags from the task's computing options.
    fn sbatch_args(ctx: &TaskContext) -> Vec<String> {
        let options = ctx.task.computing_options();
        let mut args = Vec::new();
        if let Some(partition) = &options.partition {
            args.push(format!("-p {}", shell_quote(partition)));
        }
        if let Some(cpus) = options.cpus {
            args.push(format!("--cpus-per-task={cpus}"));
        }
        if let Some(memory) = &options.memory {
            args.push(format!("--mem={}", shell_quote(memory)));
        }
        args.push(format!("--job-name={}", job_name(ctx)));
        let log = log_path(ctx);
        args.push(format!("--output={log}"));
        args.push(format!("--error={log}"));
        args
    }

    fn job_id(ctx: &TaskContext) -> Option<i64> {
        ctx.task.pid
    }
}

fn log_path(ctx: &TaskContext) -> String {
    format!("$HOME/{}.log", ctx.task.id)
}

/// Name the job is submitted under, so it can be found without its id.
fn job_name(ctx: &TaskContext) -> String {
    format!("tether-{}", ctx.task.id)
}

/// Job id from `Submitted batch job <id>`, which federated clusters
/// follow with `on cluster <name>`.
fn parse_submission(stdout: &str) -> Result<i64> {
    stdout
        .lines()
        .find_map(|line| line.split_once(SUBMITTED))
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TetherError::Protocol(format!("unexpected sbatch output {stdout:?}")))
}

#[async_trait]
impl Driver for SlurmDriver {
    fn kind(&self) -> ComputingKind {
        ComputingKind::Slurm
    }

    async fn start(&self, ctx: &TaskContext) -> Result<Launch> {
        ctx.check_runtime(ContainerRuntime::Singularity)?;
        let target = Self::target(ctx)?;
        let script_path = format!("$HOME/{}.sh", ctx.task.id);
        let submit = format!(
            "printf '%s' {} > {script_path} && sbatch {} {script_path}",
            shell_quote(&self.job_script(ctx)?),
            Self::sbatch_args(ctx).join(" ")
        );

        let stdout = self.shell.run_checked(&target.command(&submit)).await?;
        let job = parse_submission(&stdout)?;

        info!(task_id = %ctx.task.id, host = %target.host, job, "submitted batch job");
        Ok(Launch {
            tid: Some(ctx.task.id.to_string()),
            pid: Some(job),
            ip: None,
            port: None,
            status: Some(TaskStatus::Submitted),
        })
    }

    async fn stop(&self, ctx: &TaskContext) -> Result<()> {
        let Some(job) = Self::job_id(ctx) else {
            return Ok(());
        };
        let cmd = Self::target(ctx)?.command(&format!("scancel {job}"));
        let output = self.shell.run(&cmd).await?;
        if output.success() || already_gone(&output.stderr, INVALID_JOB_ID) {
            return Ok(());
        }
        output.check(&cmd).map(drop)
    }

    async fn abort(&self, ctx: &TaskContext) -> Result<()> {
        if Self::job_id(ctx).is_some() {
            return self.stop(ctx).await;
        }
        let cmd = Self::target(ctx)?.command(&format!("scancel -n {}", job_name(ctx)));
        self.shell.run_checked(&cmd).await.map(drop)
    }

    async fn fetch_log(&self, ctx: &TaskContext) -> Result<String> {
        if ctx.task.tid.is_none() {
            return Err(not_started(&ctx.task));
        }
        let cmd = Self::target(ctx)?.command(&format!("cat {}", log_path(ctx)));
        self.shell.run_checked(&cmd).await
    }

    async fn probe(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        let Some(job) = Self::job_id(ctx) else {
            return Ok(None);
        };
        let cmd = Self::target(ctx)?.command(&format!("squeue -h -j {job} -o %T"));
        let output = self.shell.run(&cmd).await?;
        if !output.success() && already_gone(&output.stderr, INVALID_JOB_ID) {
            return Ok(Some(TaskStatus::Exited));
        }
        let output = output.check(&cmd)?;

        let state = output.stdout.trim();
        if state.is_empty() || FINISHED_STATES.contains(&state) {
            return Ok(Some(TaskStatus::Exited));
        }
        debug!(task_id = %ctx.task.id, job, state, "job still queued or running");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::driver::fixtures::context;
    use crate::shell::{MockShell, ShellOutput};

    fn driver() -> (Arc<MockShell>, SlurmDriver) {
        let shell = Arc::new(MockShell::new());
        (shell.clone(), SlurmDriver::new(shell, Arc::new(Settings::default())))
    }

    fn slurm_ctx() -> TaskContext {
        context(ComputingKind::Slurm, json!({"master": "slurm.example.org", "user": "alice"}))
    }

    #[test]
    fn submission_output_is_parsed() {
        assert_eq!(parse_submission("Submitted batch job 1234").unwrap(), 1234);
        assert_eq!(parse_submission("Submitted batch job 77\n").unwrap(), 77);
        assert_eq!(parse_submission("Submitted batch job 77 on cluster c1").unwrap(), 77);
        assert_eq!(
            parse_submission("sbatch: warning: no memory limit\nSubmitted batch job 5").unwrap(),
            5
        );
        assert!(matches!(
            parse_submission("Submitted batch job"),
            Err(TetherError::Protocol(_))
        ));
        assert!(matches!(
            parse_submission("sbatch: error: invalid partition"),
            Err(TetherError::Protocol(_))
        ));
        assert!(matches!(parse_submission(""), Err(TetherError::Protocol(_))));
    }

    #[tokio::test]
    async fn start_submits_with_options_and_marks_submitted() {
        let (shell, driver) = driver();
        shell.respond("sbatch", ShellOutput::ok("Submitted batch job 1234"));
        let mut ctx = slurm_ctx();
        ctx.task.options = json!({"partition": "gpu", "cpus": 4, "memory": "8G"});

        let launch = driver.start(&ctx).await.unwrap();
        assert_eq!(launch.pid, Some(1234));
        assert_eq!(launch.status, Some(TaskStatus::Submitted));

        let cmd = &shell.runs()[0];
        assert!(cmd.args.contains(&"alice@slurm.example.org".to_owned()));
        let remote = cmd.last_arg().unwrap();
        let id = ctx.task.id;
        assert!(remote.contains("sbatch -p "), "{remote}");
        assert!(remote.contains("--cpus-per-task=4"), "{remote}");
        assert!(remote.contains(&format!("--job-name=tether-{}", ctx.task.id)), "{remote}");
        assert!(remote.contains(&format!("--output=$HOME/{id}.log --error=$HOME/{id}.log $HOME/{id}.sh")), "{remote}");
        assert!(remote.contains("action=bootstrap"), "{remote}");
    }

    #[tokio::test]
    async fn host_falls_back_when_no_master() {
        let (shell, driver) = driver();
        shell.respond("sbatch", ShellOutput::ok("Submitted batch job 9"));
        let ctx = context(ComputingKind::Slurm, json!({"host": "login.example.org", "user": "bob"}));

        driver.start(&ctx).await.unwrap();
        assert!(shell.runs()[0].args.contains(&"bob@login.example.org".to_owned()));
    }

    #[tokio::test]
    async fn stop_cancels_and_tolerates_unknown_job() {
        let (shell, driver) = driver();
        let mut ctx = slurm_ctx();
        ctx.task.pid = Some(1234);
        shell.respond("scancel", ShellOutput::failed(1, "scancel: error: Kill job error on job id 1234: Invalid job id specified"));

        driver.stop(&ctx).await.unwrap();
        assert!(shell.runs()[0].last_arg().unwrap().contains("scancel 1234"));
    }

    #[tokio::test]
    async fn abort_cancels_by_name_when_job_id_is_unknown() {
        let (shell, driver) = driver();
        let mut ctx = slurm_ctx();

        driver.abort(&ctx).await.unwrap();
        let line = shell.runs()[0].last_arg().unwrap().to_owned();
        assert!(line.contains(&format!("scancel -n tether-{}", ctx.task.id)), "{line}");

        ctx.task.pid = Some(88);
        driver.abort(&ctx).await.unwrap();
        assert!(shell.runs()[1].last_arg().unwrap().contains("scancel 88"));
    }

    #[tokio::test]
    async fn probe_maps_queue_state() {
        let (shell, driver) = driver();
        let mut ctx = slurm_ctx();
        ctx.task.pid = Some(1234);

        for (reply, expected) in [
            (ShellOutput::ok("PENDING"), None),
            (ShellOutput::ok("RUNNING"), None),
            (ShellOutput::ok("COMPLETED"), Some(TaskStatus::Exited)),
            (ShellOutput::ok(""), Some(TaskStatus::Exited)),
            (
                ShellOutput::failed(1, "slurm_load_jobs error: Invalid job id specified"),
                Some(TaskStatus::Exited),
            ),
        ] {
            shell.respond("squeue", reply.clone());
            assert_eq!(driver.probe(&ctx).await.unwrap(), expected, "{reply:?}");
        }
    }
}
