//! Subprocess seam.
//!
//! Every backend interaction (docker, ssh, sbatch, the tunnel relay) goes
//! through the [`Shell`] trait so drivers can be exercised against
//! [`MockShell`] in tests and against [`SystemShell`] in production.

pub mod mock;
pub mod system;

use std::fmt;

use async_trait::async_trait;

use crate::error::{Result, TetherError};

pub use mock::MockShell;
pub use system::SystemShell;

/// A program and its argv. Never interpreted by a local shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The last argument. For ssh invocations this is the remote script.
    pub fn last_arg(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            f.write_str(" ")?;
            if arg.is_empty() || arg.chars().any(|c| !is_shell_safe(c)) {
                f.write_str(&shell_quote(arg))?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c)
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Standard output with trailing newlines removed.
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// A zero exit with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A non-zero exit with the given stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`TetherError::Execution`].
    pub fn check(self, command: &ShellCommand) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(TetherError::Execution {
                command: command.program.clone(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs backend subprocesses.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is not an
    /// error here; implementations bound the run with a timeout and return
    /// [`TetherError::TimedOut`] when it fires.
    async fn run(&self, command: &ShellCommand) -> Result<ShellOutput>;

    /// Start a long-lived process without waiting for it and return its pid.
    async fn spawn_detached(&self, command: &ShellCommand) -> Result<u32>;

    /// Whether a process with this pid exists.
    async fn is_alive(&self, pid: u32) -> bool;

    /// Arguments of a running process joined with spaces, or `None` where
    /// that cannot be read.
    async fn command_line(&self, pid: u32) -> Option<String>;

    /// Ask a process to exit. A pid that no longer exists is not an error.
    async fn terminate(&self, pid: u32) -> Result<()>;

    /// [`Shell::run`], failing on a non-zero exit, returning stdout.
    async fn run_checked(&self, command: &ShellCommand) -> Result<String> {
        let output = self.run(command).await?;
        Ok(output.check(command)?.stdout)
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn Shell) {}
};

/// Quote a string for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
