//! Worker-side watch loop.
//!
//! A session re-runs one task until it is closed: execute, report the cycle
//! over the watch channel, wait for a watched file to change, repeat.
//! Closing is an explicit state machine, `Running → Closing → Closed`; the
//! loop finishes the cycle it is in and hands back its last result.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::channel::{WatchClient, WatchMessage};
use crate::config::Configuration;
use crate::error::{BuildError, BuildResult, Result};
use crate::executor::{TaskExecutor, app_name};
use crate::task::WatchSettings;
use crate::theme;

const CONNECT_RETRIES: usize = 50;
const CONNECT_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Closing,
    Closed,
}

/// A running watch loop for one target.
pub struct WatchSession {
    index: usize,
    state: Arc<Mutex<SessionState>>,
    close_tx: Option<Sender<()>>,
    outcome: Receiver<BuildResult>,
    executor: Arc<dyn TaskExecutor>,
    thread: Option<JoinHandle<()>>,
}

struct Cycle {
    executor: Arc<dyn TaskExecutor>,
    config: Configuration,
    index: usize,
    expected_count: usize,
    silent: bool,
    interval: Duration,
    watched: Vec<PathBuf>,
}

impl WatchSession {
    /// Connect to the coordinator's watch channel and start looping.
    pub fn start(
        executor: Arc<dyn TaskExecutor>,
        config: Configuration,
        index: usize,
        expected_count: usize,
        settings: &WatchSettings,
        silent: bool,
    ) -> Result<Self> {
        let client = WatchClient::connect(&settings.socket, CONNECT_RETRIES, CONNECT_DELAY)?;
        let state = Arc::new(Mutex::new(SessionState::Running));
        let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(0);
        let (outcome_tx, outcome) = crossbeam_channel::bounded(1);

        let cycle = Cycle {
            executor: executor.clone(),
            watched: watch_paths(&config),
            config,
            index,
            expected_count,
            silent,
            interval: settings.interval(),
        };
        let thread_state = state.clone();
        let thread = std::thread::Builder::new()
            .name(format!("parabuild-watch-{}", index))
            .spawn(move || {
                let result = cycle.run(client, close_rx);
                if let Ok(mut state) = thread_state.lock() {
                    *state = SessionState::Closed;
                }
                let _ = outcome_tx.send(result);
            })?;

        Ok(Self {
            index,
            state,
            close_tx: Some(close_tx),
            outcome,
            executor,
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Closed)
    }

    /// Resolves once with the last cycle's result when the loop ends.
    pub fn outcome(&self) -> &Receiver<BuildResult> {
        &self.outcome
    }

    /// Ask the loop to stop and wait up to `grace` for it.
    ///
    /// Returns the last cycle's result, or `None` if the loop did not finish
    /// in time or already delivered its outcome.
    pub fn close(&mut self, grace: Duration) -> Option<BuildResult> {
        if let Ok(mut state) = self.state.lock()
            && *state == SessionState::Running
        {
            *state = SessionState::Closing;
        }
        if self.close_tx.take().is_some() {
            debug!(index = self.index, "Closing watch session");
            self.executor.cancel();
        }

        let result = self.outcome.recv_timeout(grace).ok();
        if self.state() == SessionState::Closed
            && let Some(thread) = self.thread.take()
        {
            let _ = thread.join();
        }
        result
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.close_tx.take();
    }
}

impl Cycle {
    fn run(self, mut client: WatchClient, close_rx: Receiver<()>) -> BuildResult {
        let name = app_name(&self.config);
        let mut cycles = 0u64;
        loop {
            cycles += 1;
            let start = Instant::now();
            if !self.silent {
                theme::info(&format!("Started building {}", name));
            }
            let result = self
                .executor
                .execute(&self.config, self.index, self.expected_count);
            match &result {
                Ok(_) => {
                    if !self.silent {
                        theme::success(&format!(
                            "Finished building {} within {} seconds",
                            name,
                            theme::seconds(start.elapsed())
                        ));
                    }
                }
                Err(e) => {
                    warn!(index = self.index, cycle = cycles, error = %e, "Watch cycle failed");
                    if !self.silent {
                        theme::error(&e.to_string());
                    }
                }
            }

            if is_closing(&close_rx) {
                info!(index = self.index, cycles, "Watch session closed mid-cycle");
                return result;
            }

            for message in [
                WatchMessage::Done { index: self.index },
                WatchMessage::WatchCycle { index: self.index },
            ] {
                if let Err(e) = client.send(&message) {
                    warn!(index = self.index, error = %e, "Watch channel gone, stopping");
                    return Err(BuildError::Worker(format!(
                        "Watch channel closed for target {}",
                        self.index
                    )));
                }
            }

            if !self.wait_for_change(&close_rx) {
                info!(index = self.index, cycles, "Watch session closed");
                return result;
            }
        }
    }

    /// Block until a watched path changes, or one interval passes when
    /// nothing is watched. `false` once the session is closing.
    fn wait_for_change(&self, close_rx: &Receiver<()>) -> bool {
        let before = snapshot(&self.watched);
        loop {
            match close_rx.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if self.watched.is_empty() || snapshot(&self.watched) != before {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }
}

/// The close sender is dropped on close, disconnecting the receiver.
fn is_closing(close_rx: &Receiver<()>) -> bool {
    matches!(close_rx.try_recv(), Err(TryRecvError::Disconnected))
}

/// Paths listed in the configuration's `watch` field, relative to its `cwd`.
pub fn watch_paths(config: &Configuration) -> Vec<PathBuf> {
    let base = config.get("cwd").and_then(Value::as_str).map(Path::new);
    config
        .get("watch")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .map(|p| match base {
                    Some(base) => base.join(p),
                    None => PathBuf::from(p),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn snapshot(paths: &[PathBuf]) -> Vec<Option<SystemTime>> {
    paths
        .iter()
        .map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
        .collect()
}
