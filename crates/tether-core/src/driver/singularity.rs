//! Singularity launch scripts shared by the remote, double-hop and slurm
//! drivers.

use uuid::Uuid;

use tether_db::models::Registry;

use crate::error::{Result, TetherError};
use crate::shell::shell_quote;

/// Where the container learns its `BASE_PORT` from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortSource {
    /// Fetch and run the agent bootstrap script from this URL.
    Agent { bootstrap_url: String },
    Fixed(i32),
}

#[derive(Debug, Clone)]
pub(crate) struct SingularityLaunch {
    pub task_id: Uuid,
    /// Full image reference including the `docker://` scheme.
    pub image: String,
    pub binds: Vec<String>,
    pub auth_pass: Option<String>,
    pub port: PortSource,
    /// Shell commands run before the container starts.
    pub setup_command: Option<String>,
    pub log_path: String,
}

/// `docker://` reference for a remote pull.
pub(crate) fn image_ref(registry: Registry, remote_registry: &str, image: &str) -> String {
    match registry {
        Registry::DockerLocal => format!("docker://{remote_registry}/{image}"),
        Registry::DockerHub => format!("docker://{image}"),
    }
}

/// Per-task working directory on the backend.
pub(crate) fn data_dir(task_id: Uuid) -> String {
    format!("/tmp/{task_id}_data")
}

impl SingularityLaunch {
    pub fn data_dir(&self) -> String {
        data_dir(self.task_id)
    }

    /// Recreate the data directory. Runs in the foreground so the log file
    /// exists before anything is redirected into it.
    pub fn prepare(&self) -> String {
        let dir = self.data_dir();
        format!("rm -rf {dir} && mkdir -p {dir}/tmp {dir}/home && chmod 700 {dir}")
    }

    /// Steps from port selection to `exec singularity run`, joined with
    /// `&&`. Output is expected to be redirected by the caller.
    pub fn steps(&self) -> Result<String> {
        let dir = self.data_dir();
        let mut steps = Vec::new();

        match &self.port {
            PortSource::Agent { bootstrap_url } => {
                steps.push(format!("wget -q -O {dir}/agent.sh {}", shell_quote(bootstrap_url)));
                steps.push(format!("BASE_PORT=$(bash {dir}/agent.sh)"));
                steps.push("export BASE_PORT".to_owned());
            }
            PortSource::Fixed(port) => steps.push(format!("export BASE_PORT={port}")),
        }
        if let Some(setup) = &self.setup_command {
            steps.push(setup.clone());
        }
        steps.push("export SINGULARITY_NOHTTPS=true".to_owned());
        steps.push("export SINGULARITYENV_BASE_PORT=$BASE_PORT".to_owned());
        if let Some(pass) = &self.auth_pass {
            steps.push(format!("export SINGULARITYENV_AUTH_PASS={}", shell_quote(pass)));
        }

        let mut run = vec!["exec nohup singularity run".to_owned()];
        if !self.binds.is_empty() {
            for bind in &self.binds {
                if bind.contains(char::is_whitespace) {
                    return Err(TetherError::Configuration(format!(
                        "bind {bind:?} contains whitespace"
                    )));
                }
            }
            run.push(format!("-B {}", shell_quote(&self.binds.join(","))));
        }
        run.push(format!(
            "--pid --writable-tmpfs --no-home --home=/home/metauser --workdir {dir}/tmp -B{dir}/home:/home --containall --cleanenv {}",
            shell_quote(&self.image)
        ));
        steps.push(run.join(" "));

        Ok(steps.join(" && "))
    }

    /// Prepare, then run the steps in the background with output appended
    /// to the log. Prints the background pid.
    pub fn detached_script(&self) -> Result<String> {
        Ok(format!(
            "{} && {{ ( {} ) </dev/null >>{} 2>&1 & echo $!; }}",
            self.prepare(),
            self.steps()?,
            self.log_path
        ))
    }

    /// Batch job script; the scheduler captures output.
    pub fn job_script(&self) -> Result<String> {
        Ok(format!("#!/bin/bash\n{} && {}\n", self.prepare(), self.steps()?))
    }
}
