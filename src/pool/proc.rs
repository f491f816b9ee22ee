//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its IPC pipes.

use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{BuildError, Result};

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    /// Exit status once the process has been reaped.
    status: Option<WaitStatus>,
}

impl Proc {
    /// Take over a spawned child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BuildError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BuildError::Worker("Child stdout not captured".into()))?;

        // Reaping goes through waitpid on `pid`; the Child itself is not waited on.
        drop(child);

        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(stdin)),
            reader: LineReader::new(PipeFd::new(stdout)),
            status: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        self.writer
            .write_message(request)
            .map_err(|e| BuildError::Worker(format!("Failed to send to worker {}: {}", self.pid, e)))
    }

    /// Next response, `None` once the worker closed its stdout.
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        self.reader.read_message().map_err(|e| {
            BuildError::Worker(format!("Failed to receive from worker {}: {}", self.pid, e))
        })
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Non-blocking reap; `None` while still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => Err(BuildError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Blocking reap.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status =
            waitpid(self.pid, None).map_err(|e| BuildError::Worker(format!("waitpid failed: {}", e)))?;
        self.status = Some(status);
        Ok(status)
    }

    /// Why the process went away, waiting up to `timeout` for it to exit.
    pub fn termination_reason(&mut self, timeout: Duration) -> TerminationReason {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return analyze_wait_status(status),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Ok(None) => return TerminationReason::StillAlive,
                Err(_) => return TerminationReason::Unknown,
            }
        }
    }

    pub fn terminate(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| BuildError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// SIGKILL and reap.
    pub fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| BuildError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Ask the worker to exit, then SIGTERM, then SIGKILL once `grace` is spent.
    pub fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        let _ = self.send(&WorkRequest::Exit);
        if self.wait_until(Instant::now() + grace / 2) {
            return Ok(());
        }

        let _ = self.terminate();
        if self.wait_until(Instant::now() + grace / 2) {
            return Ok(());
        }

        tracing::warn!(pid = %self.pid, "Worker ignored stop request, killing");
        self.kill()
    }

    fn wait_until(&mut self, deadline: Instant) -> bool {
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        matches!(self.try_wait(), Ok(Some(_)))
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
