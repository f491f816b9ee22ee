//! Worker process entry point.
//!
//! This module contains the main loop for worker subprocesses. The worker
//! reads requests from stdin, runs them through a [`TaskExecutor`], and
//! writes responses to stdout. It announces `ready` on startup and after
//! every response.
//!
//! An interrupt, SIGTERM, or the parent closing stdin all start the same
//! shutdown: a running task is cancelled (or its watch session closed), a
//! synthetic `terminated` error is reported for it, and the process exits.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, info, warn};

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::config::{ConfigSet, Configuration, load_config};
use crate::error::{BuildError, BuildResult, Result};
use crate::executor::{TaskExecutor, app_name};
use crate::shutdown::{ShutdownCoordinator, install_signal_handler};
use crate::task::{Task, TaskSource};
use crate::theme;
use crate::watch::WatchSession;

/// How long a worker may spend winding down before it exits forcefully.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolve the configuration a task runs, checking that a loaded file has
/// as many entries as the coordinator dispatched.
pub fn resolve_config(task: &Task) -> Result<Configuration> {
    match &task.source {
        TaskSource::Inline { config } => Ok(config.clone()),
        TaskSource::File { path, context } => {
            let configs = load_config(path, context)?;
            check_dispatch(&configs, task.index, task.expected_count)?;
            configs
                .get(task.index)
                .cloned()
                .ok_or(BuildError::DispatchMismatch {
                    index: task.index,
                    expected: task.expected_count,
                    actual: configs.len(),
                })
        }
    }
}

fn check_dispatch(configs: &ConfigSet, index: usize, expected: usize) -> Result<()> {
    let consistent = match configs {
        ConfigSet::Single(_) => expected == 1,
        ConfigSet::Many(list) => list.len() == expected,
    };
    if consistent {
        Ok(())
    } else {
        Err(BuildError::DispatchMismatch {
            index,
            expected,
            actual: configs.len(),
        })
    }
}

/// Load and run one task, with progress notices.
fn execute_task(executor: &dyn TaskExecutor, task: &Task) -> BuildResult {
    let config = resolve_config(task)?;
    let name = app_name(&config);
    let start = Instant::now();
    if !task.silent {
        theme::info(&format!("Started building {}", name));
    }
    let result = executor.execute(&config, task.index, task.expected_count);
    if result.is_ok() && !task.silent {
        theme::success(&format!(
            "Finished building {} within {} seconds",
            name,
            theme::seconds(start.elapsed())
        ));
    }
    result
}

/// The task currently owned by this worker.
enum Active {
    Build { index: usize },
    Watch { index: usize, session: WatchSession },
}

impl Active {
    fn index(&self) -> usize {
        match self {
            Self::Build { index } | Self::Watch { index, .. } => *index,
        }
    }
}

struct Worker {
    executor: Arc<dyn TaskExecutor>,
    writer: LineWriter,
    outcomes_tx: Sender<(usize, BuildResult)>,
    outcomes: Receiver<(usize, BuildResult)>,
    active: Option<Active>,
    /// Display name of the active task, for the shutdown report.
    active_name: String,
}

impl Worker {
    fn new(executor: Arc<dyn TaskExecutor>, writer: LineWriter) -> Self {
        let (outcomes_tx, outcomes) = crossbeam_channel::unbounded();
        Self {
            executor,
            writer,
            outcomes_tx,
            outcomes,
            active: None,
            active_name: String::new(),
        }
    }

    fn respond(&mut self, index: usize, result: &BuildResult) -> io::Result<()> {
        self.writer
            .write_message(&WorkResponse::from_result(index, result))?;
        self.writer.write_message(&WorkResponse::Ready)
    }

    fn start(&mut self, task: Task) -> io::Result<()> {
        let index = task.index;
        if let Some(active) = &self.active {
            warn!(index, active = active.index(), "Build request while busy");
            let busy = Err(BuildError::Worker(format!(
                "Worker is still building target {}",
                active.index()
            )));
            return self.respond(index, &busy);
        }

        match task.watch.clone() {
            Some(settings) => {
                let started = resolve_config(&task).and_then(|config| {
                    self.active_name = app_name(&config);
                    WatchSession::start(
                        self.executor.clone(),
                        config,
                        index,
                        task.expected_count,
                        &settings,
                        task.silent,
                    )
                });
                match started {
                    Ok(session) => {
                        debug!(index, "Watch session started");
                        self.active = Some(Active::Watch { index, session });
                        Ok(())
                    }
                    Err(e) => self.respond(index, &Err(e)),
                }
            }
            None => {
                self.active_name = match &task.source {
                    TaskSource::Inline { config } => app_name(config),
                    TaskSource::File { path, .. } => path.display().to_string(),
                };
                let executor = self.executor.clone();
                let tx = self.outcomes_tx.clone();
                std::thread::Builder::new()
                    .name(format!("parabuild-task-{}", index))
                    .spawn(move || {
                        let result = execute_task(executor.as_ref(), &task);
                        let _ = tx.send((index, result));
                    })?;
                self.active = Some(Active::Build { index });
                Ok(())
            }
        }
    }

    fn finish(&mut self, index: usize, result: BuildResult) -> io::Result<()> {
        self.active = None;
        self.respond(index, &result)
    }

    /// Receiver for the end of an active watch session, if any.
    fn watch_outcome(&self) -> Receiver<BuildResult> {
        match &self.active {
            Some(Active::Watch { session, .. }) => session.outcome().clone(),
            _ => crossbeam_channel::never(),
        }
    }

    /// Stop whatever is running and report it as terminated.
    fn shut_down(&mut self, grace: Duration) {
        let Some(active) = self.active.take() else {
            return;
        };
        let index = active.index();
        match active {
            Active::Build { .. } => self.executor.cancel(),
            Active::Watch { mut session, .. } => {
                session.close(grace);
            }
        }
        let reason = format!("Forcefully shut down {}", self.active_name);
        info!(index, "{}", reason);
        // The parent may already be gone.
        let _ = self
            .writer
            .write_message(&WorkResponse::from_result(
                index,
                &Err(BuildError::Terminated { index, reason }),
            ));
    }
}

/// Worker main loop.
fn worker_loop(
    worker: &mut Worker,
    requests: Receiver<WorkRequest>,
    coordinator: &ShutdownCoordinator,
) -> io::Result<()> {
    worker.writer.write_message(&WorkResponse::Ready)?;

    let shutdown = coordinator.notified();
    let outcomes = worker.outcomes.clone();
    let mut disconnected = false;
    loop {
        let incoming = if disconnected {
            crossbeam_channel::never()
        } else {
            requests.clone()
        };
        let watch_outcome = worker.watch_outcome();
        select! {
            recv(incoming) -> request => match request {
                Ok(WorkRequest::Build(task)) => worker.start(task)?,
                Ok(WorkRequest::Exit) => {
                    debug!("Exit requested");
                    worker.shut_down(SHUTDOWN_GRACE);
                    return Ok(());
                }
                Err(_) => {
                    // Parent closed our stdin.
                    debug!("Parent disconnected");
                    disconnected = true;
                    coordinator.interrupt();
                }
            },
            recv(outcomes) -> outcome => {
                if let Ok((index, result)) = outcome {
                    worker.finish(index, result)?;
                }
            },
            recv(watch_outcome) -> outcome => {
                let index = worker.active.as_ref().map(Active::index);
                if let Some(index) = index {
                    let result = outcome.unwrap_or_else(|_| {
                        Err(BuildError::Worker("Watch session ended without a result".into()))
                    });
                    worker.finish(index, result)?;
                }
            },
            recv(shutdown) -> _ => {
                worker.shut_down(coordinator.grace() / 2);
                return Ok(());
            },
        }
    }
}

fn spawn_request_reader(mut reader: LineReader) -> io::Result<Receiver<WorkRequest>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name("parabuild-worker-stdin".into())
        .spawn(move || {
            loop {
                match reader.read_message::<WorkRequest>() {
                    Ok(Some(request)) => {
                        if tx.send(request).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        warn!(error = %e, "Ignoring invalid request");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read request");
                        return;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Run the worker subprocess main function.
///
/// This function never returns normally; the process exits with 0 after a
/// clean stop or 1 if its pipes failed.
pub fn run_worker_main(executor: Arc<dyn TaskExecutor>) -> ! {
    // Ignore SIGPIPE - we handle pipe errors via io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let coordinator = ShutdownCoordinator::new(SHUTDOWN_GRACE);
    if let Err(e) = install_signal_handler(&coordinator) {
        warn!(error = %e, "Worker runs without a signal handler");
    }

    // Safety: file descriptors 0 and 1 are always valid for stdin/stdout
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };

    let outcome = spawn_request_reader(LineReader::new(stdin_fd)).and_then(|requests| {
        let mut worker = Worker::new(executor, LineWriter::new(stdout_fd));
        worker_loop(&mut worker, requests, &coordinator)
    });
    coordinator.complete();

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
