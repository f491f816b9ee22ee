//! Worker subprocess spawning.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::proc::Proc;
use crate::error::{BuildError, Result};

/// Flag that switches the parabuild binary into worker mode.
pub const INTERNAL_WORKER_FLAG: &str = "--internal-worker";

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Re-run the current executable in worker mode.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| BuildError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe).arg(INTERNAL_WORKER_FLAG))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Spawn a worker subprocess.
///
/// stdin/stdout carry the protocol; stderr is shared with the coordinator.
pub fn spawn_worker(command: &WorkerCommand) -> Result<Proc> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.envs(command.env.iter().map(|(k, v)| (k, v)));

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| {
        BuildError::Worker(format!(
            "Failed to spawn worker {}: {}",
            command.program.display(),
            e
        ))
    })?;

    tracing::debug!(pid = child.id(), program = %command.program.display(), "Spawned worker");
    Proc::from_child(child)
}
