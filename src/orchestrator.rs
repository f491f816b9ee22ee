//! Dispatching a configuration set across workers and collecting results.
//!
//! Two completion policies:
//!
//! - **fail-fast** (`bail`): the first failure is returned at once; results
//!   of outstanding tasks are ignored.
//! - **collect-all**: every task settles first, then the failure with the
//!   lowest index (if any) is returned.
//!
//! Results are always positional: `results[i]` belongs to configuration `i`,
//! whatever order the workers finished in.

use std::path::Path;
use std::time::Instant;

use crossbeam_channel::{Receiver, Select};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ConfigSet;
use crate::error::{BuildError, BuildResult, Result};
use crate::options::RunOptions;
use crate::pool::WorkerPool;
use crate::task::{Task, TaskHandle, WatchSettings};
use crate::theme::{self, Themed};
use crate::watch::{CompletionBarrier, WatchMessage, WatchServer};

/// Something tasks can be handed to.
pub trait Dispatch {
    /// Queue a task without blocking.
    fn submit(&self, task: Task) -> TaskHandle;

    /// Stop all work; every outstanding handle must still resolve.
    fn cancel_all(&self);
}

impl Dispatch for WorkerPool {
    fn submit(&self, task: Task) -> TaskHandle {
        WorkerPool::submit(self, task)
    }

    fn cancel_all(&self) {
        self.shutdown();
    }
}

/// One task per configuration. With a path, workers load the file
/// themselves; without one, configurations travel inline.
pub fn build_tasks(
    configs: &ConfigSet,
    config_path: Option<&Path>,
    options: &RunOptions,
) -> Vec<Task> {
    let count = configs.len();
    (0..count)
        .filter_map(|index| {
            let task = match config_path {
                Some(path) => Task::from_file(path, options.context.clone(), index, count),
                None => Task::inline(configs.get(index)?.clone(), index, count),
            };
            Some(task.silent(options.silent()))
        })
        .collect()
}

/// Run every configuration once.
///
/// A single configuration takes the same path as many, so workers always see
/// a consistent index and count. When `stop` fires (a message or a
/// disconnect), the dispatcher is cancelled and the run ends with the
/// resulting shutdown failure.
pub fn run_builds(
    configs: &ConfigSet,
    config_path: Option<&Path>,
    options: &RunOptions,
    dispatcher: &dyn Dispatch,
    stop: &Receiver<()>,
) -> Result<Vec<Value>> {
    let tasks = build_tasks(configs, config_path, options);
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    if !options.silent() {
        theme::info(&format!(
            "Building {} {}",
            tasks.len().count(),
            theme::pluralize("target", tasks.len())
        ));
    }
    info!(targets = tasks.len(), bail = options.bail, "Dispatching builds");

    let handles: Vec<TaskHandle> = tasks.into_iter().map(|t| dispatcher.submit(t)).collect();
    collect(handles, options.bail, dispatcher, stop)
}

enum Event {
    Stop,
    Settled(usize, BuildResult),
}

/// Wait for the next settled handle, or for `stop`.
fn next_event(pending: &[TaskHandle], stop: Option<&Receiver<()>>) -> Event {
    let mut sel = Select::new();
    for handle in pending {
        sel.recv(handle.receiver());
    }
    let stop_op = stop.map(|stop| sel.recv(stop));

    let oper = sel.select();
    let op = oper.index();
    if let Some(stop) = stop
        && stop_op == Some(op)
    {
        let _ = oper.recv(stop);
        return Event::Stop;
    }
    let handle = &pending[op];
    let result = oper
        .recv(handle.receiver())
        .unwrap_or_else(|_| Err(handle.dropped()));
    Event::Settled(op, result)
}

fn collect(
    mut pending: Vec<TaskHandle>,
    bail: bool,
    dispatcher: &dyn Dispatch,
    stop: &Receiver<()>,
) -> Result<Vec<Value>> {
    let mut results: Vec<Option<BuildResult>> = (0..pending.len()).map(|_| None).collect();
    let mut stopped = false;

    while !pending.is_empty() {
        let event = next_event(&pending, (!stopped).then_some(stop));
        match event {
            Event::Stop => {
                warn!("Stop requested, cancelling outstanding builds");
                stopped = true;
                dispatcher.cancel_all();
            }
            Event::Settled(position, result) => {
                let handle = pending.swap_remove(position);
                let index = handle.index();
                debug!(index, ok = result.is_ok(), "Target settled");
                if bail && let Err(e) = result {
                    debug!(index, outstanding = pending.len(), "Failing fast");
                    return Err(e);
                }
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
        }
    }

    // Index order decides which failure is reported.
    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            result.unwrap_or_else(|| {
                Err(BuildError::Worker(format!("Target {} never settled", index)))
            })
        })
        .collect()
}

/// Callbacks for a watch run.
pub struct WatchHooks<'a> {
    /// Every target finished a cycle; receives the cycle number.
    pub on_cycle: Box<dyn FnMut(u64) + 'a>,
    /// One target finished a cycle.
    pub on_progress: Box<dyn FnMut(usize) + 'a>,
}

impl Default for WatchHooks<'_> {
    fn default() -> Self {
        Self {
            on_cycle: Box::new(|_| {}),
            on_progress: Box::new(|_| {}),
        }
    }
}

enum WatchEvent {
    Message(WatchMessage),
    MessagesClosed,
    Stop,
    Settled(usize, BuildResult),
    TimedOut,
}

/// Run every configuration in watch mode until `stop` fires.
///
/// Workers report each finished cycle over `server`; a [`CompletionBarrier`]
/// over all targets calls `hooks.on_cycle` whenever every target has
/// reported. With `watch_timeout` set, a stretch that long without a
/// completed cycle fails with [`BuildError::WatchTimeout`]. Returns the
/// number of completed cycles.
pub fn run_watch(
    configs: &ConfigSet,
    config_path: Option<&Path>,
    options: &RunOptions,
    dispatcher: &dyn Dispatch,
    server: &WatchServer,
    stop: &Receiver<()>,
    hooks: WatchHooks<'_>,
) -> Result<u64> {
    let WatchHooks {
        on_cycle,
        mut on_progress,
    } = hooks;
    let settings = WatchSettings {
        socket: server.path().to_path_buf(),
        interval_ms: options.watch_interval.as_millis() as u64,
        close_grace_ms: (options.shutdown_grace / 2).as_millis() as u64,
    };
    let tasks = build_tasks(configs, config_path, options);
    if !options.silent() {
        theme::info(&format!(
            "Watching {} {}",
            tasks.len().count(),
            theme::pluralize("target", tasks.len())
        ));
    }
    info!(targets = tasks.len(), socket = %settings.socket.display(), "Starting watch");

    let mut barrier = CompletionBarrier::new(tasks.len(), on_cycle);
    let mut pending: Vec<TaskHandle> = tasks
        .into_iter()
        .map(|t| dispatcher.submit(t.watching(settings.clone())))
        .collect();

    let mut deadline = options.watch_timeout.map(|t| Instant::now() + t);
    let mut stopped = false;
    let mut messages_open = true;

    loop {
        if pending.is_empty() {
            if !stopped {
                warn!("All watch tasks ended");
            }
            return Ok(barrier.cycles_completed());
        }

        let event = {
            let mut sel = Select::new();
            for handle in &pending {
                sel.recv(handle.receiver());
            }
            let messages_op = messages_open.then(|| sel.recv(server.messages()));
            let stop_op = (!stopped).then(|| sel.recv(stop));

            let selected = match deadline {
                Some(deadline) if !stopped => sel.select_deadline(deadline).ok(),
                _ => Some(sel.select()),
            };
            match selected {
                None => WatchEvent::TimedOut,
                Some(oper) => {
                    let op = oper.index();
                    if messages_op == Some(op) {
                        match oper.recv(server.messages()) {
                            Ok(message) => WatchEvent::Message(message),
                            Err(_) => WatchEvent::MessagesClosed,
                        }
                    } else if stop_op == Some(op) {
                        let _ = oper.recv(stop);
                        WatchEvent::Stop
                    } else {
                        let handle = &pending[op];
                        let result = oper
                            .recv(handle.receiver())
                            .unwrap_or_else(|_| Err(handle.dropped()));
                        WatchEvent::Settled(op, result)
                    }
                }
            }
        };

        match event {
            WatchEvent::Message(WatchMessage::Done { index }) => {
                if barrier.report(index) {
                    deadline = options.watch_timeout.map(|t| Instant::now() + t);
                }
            }
            WatchEvent::Message(WatchMessage::WatchCycle { index }) => on_progress(index),
            WatchEvent::MessagesClosed => messages_open = false,
            WatchEvent::Stop => {
                info!(cycles = barrier.cycles_completed(), "Stopping watch");
                stopped = true;
                dispatcher.cancel_all();
            }
            WatchEvent::TimedOut => {
                let waiting: Vec<usize> = barrier.pending().collect();
                warn!(?waiting, "Watch cycle did not complete in time");
                let timeout = options.watch_timeout.unwrap_or_default();
                return Err(BuildError::WatchTimeout(timeout));
            }
            WatchEvent::Settled(position, result) => {
                let handle = pending.swap_remove(position);
                match result {
                    Err(e) if !stopped && !e.is_shutdown() => {
                        warn!(index = handle.index(), error = %e, "Watch task failed");
                        return Err(e);
                    }
                    _ => debug!(index = handle.index(), "Watch task ended"),
                }
            }
        }
    }
}
