//! Tasks and their result handles.

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::config::{Configuration, LoadContext};
use crate::error::{BuildError, BuildResult};

/// Where a worker gets the configuration for its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSource {
    /// Load the configuration file and pick the entry at the task's index.
    File { path: PathBuf, context: LoadContext },
    /// Use the given configuration as-is.
    Inline { config: Configuration },
}

/// Watch-mode parameters for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Socket the coordinator's watch channel listens on.
    pub socket: PathBuf,
    /// Change polling interval in milliseconds.
    pub interval_ms: u64,
    /// How long a closing watch loop may take to finish its cycle.
    pub close_grace_ms: u64,
}

impl WatchSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// One unit of work: a configuration, its index, and the size of its set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub source: TaskSource,
    pub index: usize,
    pub expected_count: usize,
    /// Suppress human-facing notices in the worker.
    #[serde(default)]
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<WatchSettings>,
}

impl Task {
    pub fn from_file(
        path: impl Into<PathBuf>,
        context: LoadContext,
        index: usize,
        expected_count: usize,
    ) -> Self {
        Self {
            source: TaskSource::File {
                path: path.into(),
                context,
            },
            index,
            expected_count,
            silent: false,
            watch: None,
        }
    }

    pub fn inline(config: Configuration, index: usize, expected_count: usize) -> Self {
        Self {
            source: TaskSource::Inline { config },
            index,
            expected_count,
            silent: false,
            watch: None,
        }
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn watching(mut self, settings: WatchSettings) -> Self {
        self.watch = Some(settings);
        self
    }
}

/// Resolves a [`TaskHandle`] exactly once.
#[derive(Debug)]
pub struct TaskCompleter {
    index: usize,
    tx: Sender<BuildResult>,
}

impl TaskCompleter {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Deliver the result. Consumes the completer, so a task resolves once.
    pub fn complete(self, result: BuildResult) {
        // The waiting side may already have given up (fail-fast).
        let _ = self.tx.send(result);
    }
}

/// Pending result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    index: usize,
    rx: Receiver<BuildResult>,
}

impl TaskHandle {
    /// A connected completer/handle pair for task `index`.
    pub fn channel(index: usize) -> (TaskCompleter, TaskHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (TaskCompleter { index, tx }, TaskHandle { index, rx })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn receiver(&self) -> &Receiver<BuildResult> {
        &self.rx
    }

    /// Block until the task resolves.
    pub fn wait(self) -> BuildResult {
        self.rx.recv().unwrap_or_else(|_| Err(self.dropped()))
    }

    /// Block for at most `timeout`; `None` if the task is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BuildResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(self.dropped())),
        }
    }

    /// Error used when the completer vanished without resolving, which only
    /// happens when the pool is torn down.
    pub fn dropped(&self) -> BuildError {
        BuildError::PoolShutDown { index: self.index }
    }
}
