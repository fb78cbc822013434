//! Scriptable [`Shell`] test double.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Shell, ShellCommand, ShellOutput};
use crate::error::{Result, TetherError};

#[derive(Debug, Clone)]
enum Reply {
    Output(ShellOutput),
    TimeOut,
}

#[derive(Debug)]
struct State {
    /// `(needle, reply)`; the most recently added matching rule wins.
    rules: Vec<(String, Reply)>,
    runs: Vec<ShellCommand>,
    spawned: Vec<(u32, ShellCommand)>,
    alive: HashSet<u32>,
    /// Live pids now owned by something other than what was spawned.
    reused: HashMap<u32, String>,
    terminated: Vec<u32>,
    next_pid: u32,
}

/// Records every command and answers `run` from substring rules matched
/// against the rendered command line. Unmatched commands succeed with empty
/// output. Detached spawns get fresh fake pids that stay alive until
/// terminated or [`MockShell::kill`]ed.
#[derive(Debug)]
pub struct MockShell {
    state: Mutex<State>,
}

impl Default for MockShell {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                rules: Vec::new(),
                runs: Vec::new(),
                spawned: Vec::new(),
                alive: HashSet::new(),
                reused: HashMap::new(),
                terminated: Vec::new(),
                next_pid: 40_000,
            }),
        }
    }
}

impl MockShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer commands whose rendered line contains `needle` with `output`.
    pub fn respond(&self, needle: &str, output: ShellOutput) -> &Self {
        self.state()
            .rules
            .push((needle.to_owned(), Reply::Output(output)));
        self
    }

    /// Make commands containing `needle` time out.
    pub fn time_out(&self, needle: &str) -> &Self {
        self.state().rules.push((needle.to_owned(), Reply::TimeOut));
        self
    }

    /// Commands passed to [`Shell::run`], in order.
    pub fn runs(&self) -> Vec<ShellCommand> {
        self.state().runs.clone()
    }

    /// Rendered command lines of [`MockShell::runs`].
    pub fn run_lines(&self) -> Vec<String> {
        self.state().runs.iter().map(ToString::to_string).collect()
    }

    /// Commands passed to [`Shell::spawn_detached`], with their fake pids.
    pub fn spawned(&self) -> Vec<(u32, ShellCommand)> {
        self.state().spawned.clone()
    }

    /// Pids passed to [`Shell::terminate`], in order.
    pub fn terminated(&self) -> Vec<u32> {
        self.state().terminated.clone()
    }

    /// Make a fake process die without going through `terminate`.
    pub fn kill(&self, pid: u32) {
        let mut state = self.state();
        state.alive.remove(&pid);
        state.reused.remove(&pid);
    }

    /// Let `pid` die and come back as an unrelated process running
    /// `command_line`.
    pub fn reuse_pid(&self, pid: u32, command_line: &str) {
        let mut state = self.state();
        state.alive.insert(pid);
        state.reused.insert(pid, command_line.to_owned());
    }
}

#[async_trait]
impl Shell for MockShell {
    async fn run(&self, command: &ShellCommand) -> Result<ShellOutput> {
        let line = command.to_string();
        let mut state = self.state();
        state.runs.push(command.clone());
        let reply = state
            .rules
            .iter()
            .rev()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::TimeOut) => Err(TetherError::TimedOut {
                command: command.program.clone(),
                after: Duration::from_secs(1),
            }),
            None => Ok(ShellOutput::ok("")),
        }
    }

    async fn spawn_detached(&self, command: &ShellCommand) -> Result<u32> {
        let mut state = self.state();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.alive.insert(pid);
        state.spawned.push((pid, command.clone()));
        Ok(pid)
    }

    async fn is_alive(&self, pid: u32) -> bool {
        self.state().alive.contains(&pid)
    }

    async fn command_line(&self, pid: u32) -> Option<String> {
        let state = self.state();
        if let Some(line) = state.reused.get(&pid) {
            return Some(line.clone());
        }
        if !state.alive.contains(&pid) {
            return None;
        }
        state
            .spawned
            .iter()
            .find(|(spawned, _)| *spawned == pid)
            .map(|(_, command)| command.to_string())
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let mut state = self.state();
        state.alive.remove(&pid);
        state.reused.remove(&pid);
        state.terminated.push(pid);
        Ok(())
    }
}
