use crate::shell::{ShellCommand, shell_quote};

/// Options every ssh hop gets. Batch mode turns a missing key into a
/// failure instead of a password prompt.
const SSH_OPTIONS: [&str; 5] = ["-4", "-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes"];

/// `user@host`, optionally with a private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SshTarget {
    pub user: String,
    pub host: String,
    pub identity: Option<String>,
}

impl SshTarget {
    pub fn new(user: String, host: String, identity: Option<String>) -> Self {
        Self {
            user,
            host,
            identity,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if let Some(identity) = &self.identity {
            opts.push("-i".to_owned());
            opts.push(identity.clone());
        }
        opts.extend(SSH_OPTIONS.iter().map(|s| (*s).to_owned()));
        opts
    }

    /// Run `script` with bash on this host.
    pub fn command(&self, script: &str) -> ShellCommand {
        ShellCommand::new("ssh")
            .args(self.options())
            .arg(self.destination())
            .arg(bash(script))
    }

    /// Run `script` with bash on `inner`, reached through this host.
    pub fn command_via(&self, inner: &SshTarget, script: &str) -> ShellCommand {
        let mut hop = vec!["ssh".to_owned()];
        hop.extend(inner.options());
        hop.push(inner.destination());
        hop.push(bash(script));
        let inner_line = hop
            .iter()
            .map(|part| shell_quote(part))
            .collect::<Vec<_>>()
            .join(" ");

        ShellCommand::new("ssh")
            .args(self.options())
            .arg(self.destination())
            .arg(inner_line)
    }
}

/// A relay forwarding `0.0.0.0:<listen_port>` to `to_host:to_port`, kept
/// open through `via`, or through an ssh session to this host when `None`.
pub(crate) fn forward_command(
    via: Option<&SshTarget>,
    listen_port: i32,
    to_host: &str,
    to_port: i32,
) -> ShellCommand {
    let (options, destination) = match via {
        Some(target) => (target.options(), target.destination()),
        None => (
            SSH_OPTIONS.iter().map(|s| (*s).to_owned()).collect(),
            "localhost".to_owned(),
        ),
    };
    ShellCommand::new("ssh")
        .args(options)
        .args(["-o", "ExitOnForwardFailure=yes", "-nNT", "-L"])
        .arg(forward_spec(listen_port, to_host, to_port))
        .arg(destination)
}

/// The `-L` argument of a relay; also how a running relay is recognised.
pub(crate) fn forward_spec(listen_port: i32, to_host: &str, to_port: i32) -> String {
    format!("0.0.0.0:{listen_port}:{to_host}:{to_port}")
}

fn bash(script: &str) -> String {
    format!("bash -c {}", shell_quote(script))
}
