//! Tunnel allocator: exposes a running task on a port of this host through
//! a detached ssh relay.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tether_db::models::{ComputingKind, Task};

use crate::driver::TaskContext;
use crate::driver::remotehop::Hops;
use crate::driver::ssh::{forward_command, forward_spec};
use crate::error::{Result, TetherError};
use crate::settings::TunnelSettings;
use crate::shell::{Shell, ShellCommand};
use crate::store::TaskStore;

/// Where the operator connects to reach a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct TunnelAllocator {
    shell: Arc<dyn Shell>,
    store: Arc<dyn TaskStore>,
    settings: TunnelSettings,
}

impl TunnelAllocator {
    pub fn new(shell: Arc<dyn Shell>, store: Arc<dyn TaskStore>, settings: TunnelSettings) -> Self {
        Self {
            shell,
            store,
            settings,
        }
    }

    /// Claim a relay port for the task and make sure a relay is running on
    /// it. Idempotent: a task keeps its port, and a live relay is reused.
    pub async fn connect(&self, ctx: &TaskContext) -> Result<TunnelEndpoint> {
        let task = &ctx.task;
        if task.status.is_terminal() {
            return Err(TetherError::InvalidState(format!(
                "task {} is {}, nothing to connect to",
                task.id, task.status
            )));
        }
        let (Some(ip), Some(port)) = (task.ip.as_deref(), task.port) else {
            return Err(TetherError::InvalidState(format!(
                "task {} has not reported an address yet",
                task.id
            )));
        };

        let range = self.settings.ports.clone();
        let claimed = self
            .store
            .claim_tunnel_port(task.id, range.clone())
            .await?
            .ok_or(TetherError::TunnelPortsExhausted {
                first: *range.start(),
                last: *range.end(),
            })?;
        let endpoint = TunnelEndpoint {
            host: self.settings.host.clone(),
            port: u16::try_from(claimed).map_err(|_| {
                TetherError::Protocol(format!("stored tunnel port {claimed} out of range"))
            })?,
        };

        if let Some(pid) = task.tunnel_pid.and_then(|p| u32::try_from(p).ok()) {
            if self.shell.is_alive(pid).await {
                match self.shell.command_line(pid).await {
                    Some(line) if !line.contains(&forward_spec(claimed, ip, port)) => {
                        // Still holding our port, but for an address the
                        // task has since moved away from.
                        if line.contains(&format!("0.0.0.0:{claimed}:")) {
                            self.shell.terminate(pid).await?;
                        }
                    }
                    _ => {
                        debug!(task_id = %task.id, pid, port = claimed, "reusing live relay");
                        return Ok(endpoint);
                    }
                }
            }
        }

        let relay = self.relay_command(ctx, claimed, ip, port)?;
        let pid = self.shell.spawn_detached(&relay).await?;
        self.store
            .set_tunnel_pid(task.id, i32::try_from(pid).ok())
            .await?;

        info!(task_id = %task.id, pid, port = claimed, target = %format!("{ip}:{port}"), "relay started");
        Ok(endpoint)
    }

    /// Terminate the task's relay, if it has one, and forget its pid.
    pub async fn stop(&self, task: &Task) -> Result<()> {
        let Some(pid) = task.tunnel_pid else {
            return Ok(());
        };
        if let Ok(raw) = u32::try_from(pid) {
            let recycled = match Self::spec_of(task) {
                Some(spec) => !self.is_relay(raw, &spec).await,
                None => false,
            };
            if recycled {
                debug!(task_id = %task.id, pid, "relay pid now belongs to another process");
            } else {
                self.shell.terminate(raw).await?;
            }
        } else {
            warn!(task_id = %task.id, pid, "ignoring invalid relay pid");
        }
        self.store.set_tunnel_pid(task.id, None).await?;
        info!(task_id = %task.id, pid, "relay stopped");
        Ok(())
    }

    /// Whether `pid` still runs the relay for `spec`. A command line that
    /// cannot be read is taken on trust.
    async fn is_relay(&self, pid: u32, spec: &str) -> bool {
        self.shell
            .command_line(pid)
            .await
            .is_none_or(|line| line.contains(spec))
    }

    fn spec_of(task: &Task) -> Option<String> {
        Some(forward_spec(task.tunnel_port?, task.ip.as_deref()?, task.port?))
    }

    fn relay_command(&self, ctx: &TaskContext, listen: i32, ip: &str, port: i32) -> Result<ShellCommand> {
        Ok(match ctx.computing.kind {
            ComputingKind::RemoteHop => {
                let hops = Hops::from_context(ctx)?;
                forward_command(Some(&hops.first), listen, ip, port)
            }
            ComputingKind::Local | ComputingKind::Remote | ComputingKind::Slurm => {
                forward_command(None, listen, ip, port)
            }
        })
    }
}

impl fmt::Debug for TunnelAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelAllocator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
