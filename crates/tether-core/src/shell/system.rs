use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Shell, ShellCommand, ShellOutput};
use crate::error::{Result, TetherError};

/// [`Shell`] backed by real processes.
#[derive(Debug, Clone)]
pub struct SystemShell {
    timeout: Duration,
}

impl SystemShell {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Every [`Shell::run`] is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemShell {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

fn spawn_error(command: &ShellCommand, err: std::io::Error) -> TetherError {
    TetherError::Execution {
        command: command.program.clone(),
        exit_code: None,
        stderr: format!("failed to spawn: {err}"),
    }
}

#[async_trait]
impl Shell for SystemShell {
    async fn run(&self, command: &ShellCommand) -> Result<ShellOutput> {
        debug!(program = %command.program, args = command.args.len(), "running subprocess");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(command, e))?;

        // Drain both pipes while waiting so a chatty child cannot block on a
        // full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).trim_end().to_owned()
        };

        match tokio::time::timeout(self.timeout, async {
            tokio::join!(child.wait(), read_stdout, read_stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => Ok(ShellOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            }),
            Ok((Err(e), _, _)) => Err(TetherError::Execution {
                command: command.program.clone(),
                exit_code: None,
                stderr: format!("failed to wait: {e}"),
            }),
            Err(_) => {
                let _ = child.kill().await;
                warn!(program = %command.program, timeout_secs = self.timeout.as_secs(), "subprocess timed out");
                Err(TetherError::TimedOut {
                    command: command.program.clone(),
                    after: self.timeout,
                })
            }
        }
    }

    async fn spawn_detached(&self, command: &ShellCommand) -> Result<u32> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group: the relay outlives the invoking CLI.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spawn_error(command, e))?;
        let pid = child.id().ok_or_else(|| TetherError::Execution {
            command: command.program.clone(),
            exit_code: None,
            stderr: "process exited immediately".to_owned(),
        })?;

        // Reap it when it exits; never waited on by the caller.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        debug!(program = %command.program, pid, "spawned detached process");
        Ok(pid)
    }

    #[cfg(unix)]
    async fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // Signal 0 performs the permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    async fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    async fn command_line(&self, pid: u32) -> Option<String> {
        let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
        let args: Vec<_> = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect();
        Some(args.join(" "))
    }

    #[cfg(not(target_os = "linux"))]
    async fn command_line(&self, _pid: u32) -> Option<String> {
        None
    }

    #[cfg(unix)]
    async fn terminate(&self, pid: u32) -> Result<()> {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, "process already gone");
            return Ok(());
        }
        Err(TetherError::Execution {
            command: format!("kill {pid}"),
            exit_code: None,
            stderr: err.to_string(),
        })
    }

    #[cfg(not(unix))]
    async fn terminate(&self, pid: u32) -> Result<()> {
        Err(TetherError::Configuration(format!(
            "cannot signal process {pid} on this platform"
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_output_and_exit_code() {
        let shell = SystemShell::default();
        let out = shell
            .run(&ShellCommand::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
    }

    #[tokio::test]
    async fn run_times_out() {
        let shell = SystemShell::new(Duration::from_millis(200));
        let err = shell
            .run(&ShellCommand::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::TimedOut { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_error() {
        let shell = SystemShell::default();
        let err = shell
            .run(&ShellCommand::new("definitely-not-a-real-binary-tether"))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Execution { exit_code: None, .. }));
    }

    #[tokio::test]
    async fn detached_process_can_be_checked_and_terminated() {
        let shell = SystemShell::default();
        let pid = shell
            .spawn_detached(&ShellCommand::new("sleep").arg("30"))
            .await
            .unwrap();
        assert!(shell.is_alive(pid).await);
        #[cfg(target_os = "linux")]
        assert_eq!(shell.command_line(pid).await.as_deref(), Some("sleep 30"));

        shell.terminate(pid).await.unwrap();
        // The reaper task collects the exit; poll briefly.
        let mut alive = true;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !shell.is_alive(pid).await {
                alive = false;
                break;
            }
        }
        assert!(!alive, "terminated process should disappear");

        // Signalling it again is fine.
        shell.terminate(pid).await.unwrap();
    }
}
