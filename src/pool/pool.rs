//! Worker pool: a fixed number of slots, each driving at most one worker
//! process at a time.
//!
//! Slots pull tasks from a shared queue, so `submit` never blocks. A slot
//! spawns its worker lazily, retries a task on a fresh worker when the
//! previous one crashed, and retires a worker after `max_calls_per_worker`
//! completed tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, trace, warn};

use super::proc::Proc;
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::TerminationReason;
use super::spawn::{WorkerCommand, spawn_worker};
use crate::error::{BuildError, BuildResult, Result};
use crate::options::RunOptions;
use crate::task::{Task, TaskCompleter, TaskHandle};

/// How long to wait for a dead worker's exit status when classifying a crash.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker slots (and so the maximum number of processes).
    pub worker_count: usize,
    /// Extra attempts for a task whose worker crashed.
    pub max_retries: usize,
    /// Completed tasks after which a worker is replaced.
    pub max_calls_per_worker: Option<usize>,
    /// Cooperative stop window before workers are killed.
    pub shutdown_grace: Duration,
    /// How to start a worker process.
    pub command: WorkerCommand,
}

impl WorkerPoolConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self::from_options(&RunOptions::default(), command)
    }

    pub fn from_options(options: &RunOptions, command: WorkerCommand) -> Self {
        Self {
            worker_count: options.worker_count(),
            max_retries: options.max_retries,
            max_calls_per_worker: options.max_calls_per_worker,
            shutdown_grace: options.shutdown_grace,
            command,
        }
    }
}

/// A queued task and the handle it resolves.
struct Job {
    task: Task,
    completer: TaskCompleter,
}

impl Job {
    fn reject(self, error: BuildError) {
        self.completer.complete(Err(error));
    }
}

/// What the pool knows about a slot from outside its thread.
#[derive(Default)]
struct SlotStatus {
    pid: Option<Pid>,
    busy: bool,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicUsize,
    completed: AtomicUsize,
    retired: AtomicUsize,
    crashes: AtomicUsize,
}

struct Shared {
    shutting_down: AtomicBool,
    slots: Vec<Mutex<SlotStatus>>,
    counters: Counters,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn update_slot(&self, slot: usize, f: impl FnOnce(&mut SlotStatus)) {
        if let Ok(mut status) = self.slots[slot].lock() {
            f(&mut status);
        }
    }

    fn signal_slots(&self, sig: Signal, only_busy: bool) {
        for status in &self.slots {
            let Ok(status) = status.lock() else { continue };
            if let Some(pid) = status.pid
                && (status.busy || !only_busy)
            {
                trace!(pid = %pid, signal = ?sig, "Signalling worker");
                let _ = signal::kill(pid, sig);
            }
        }
    }
}

enum Attempt {
    Done(BuildResult),
    Crashed(TerminationReason),
}

/// One worker slot, owned by its thread.
struct Worker {
    slot: usize,
    proc: Option<Proc>,
    calls: usize,
    config: Arc<WorkerPoolConfig>,
    shared: Arc<Shared>,
}

impl Worker {
    fn new(slot: usize, config: Arc<WorkerPoolConfig>, shared: Arc<Shared>) -> Self {
        Self {
            slot,
            proc: None,
            calls: 0,
            config,
            shared,
        }
    }

    /// Spawn the worker process if there is none and wait for its `ready`.
    ///
    /// A worker that exits before `ready` counts as a crash; failing to spawn
    /// at all does not.
    fn ensure_ready(&mut self) -> std::result::Result<&mut Proc, Attempt> {
        if self.proc.is_none() {
            let mut proc =
                spawn_worker(&self.config.command).map_err(|e| Attempt::Done(Err(e)))?;
            let pid = proc.pid();
            match proc.recv() {
                Ok(Some(WorkResponse::Ready)) => {}
                Ok(Some(other)) => {
                    let _ = proc.kill();
                    return Err(Attempt::Done(Err(BuildError::Worker(format!(
                        "Worker {} sent {:?} instead of ready",
                        pid, other
                    )))));
                }
                Ok(None) => {
                    let reason = proc.termination_reason(REAP_TIMEOUT);
                    debug!(
                        slot = self.slot,
                        pid = %pid,
                        reason = %reason,
                        "Worker exited before becoming ready"
                    );
                    return Err(Attempt::Crashed(reason));
                }
                Err(e) => {
                    let _ = proc.kill();
                    return Err(Attempt::Done(Err(e)));
                }
            }
            self.shared.counters.spawned.fetch_add(1, Ordering::Relaxed);
            self.shared.update_slot(self.slot, |s| s.pid = Some(pid));
            debug!(slot = self.slot, pid = %pid, "Worker ready");
            self.calls = 0;
            self.proc = Some(proc);
        }
        self.proc.as_mut().ok_or_else(|| {
            Attempt::Done(Err(BuildError::Worker(format!(
                "Worker slot {} not spawned",
                self.slot
            ))))
        })
    }

    /// Run a task, retrying on fresh workers after crashes.
    #[instrument(level = "debug", skip(self, task), fields(slot = self.slot, index = task.index))]
    fn run(&mut self, task: &Task) -> BuildResult {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let reason = match self.attempt(task) {
                Attempt::Done(result) => return result,
                Attempt::Crashed(reason) => reason,
            };
            self.shared.counters.crashes.fetch_add(1, Ordering::Relaxed);

            if self.shared.is_shutting_down() {
                return Err(BuildError::Terminated {
                    index: task.index,
                    reason: format!("worker stopped during shutdown ({})", reason),
                });
            }
            if attempts > self.config.max_retries {
                warn!(slot = self.slot, index = task.index, attempts, reason = %reason, "Worker crashed, giving up");
                return Err(BuildError::WorkerCrashed {
                    index: task.index,
                    attempts,
                    reason: reason.to_string(),
                });
            }
            warn!(
                slot = self.slot,
                index = task.index,
                attempt = attempts,
                max_retries = self.config.max_retries,
                reason = %reason,
                "Worker crashed, retrying on a fresh worker"
            );
        }
    }

    fn attempt(&mut self, task: &Task) -> Attempt {
        if self.shared.is_shutting_down() {
            return Attempt::Done(Err(BuildError::PoolShutDown { index: task.index }));
        }
        let proc = match self.ensure_ready() {
            Ok(proc) => proc,
            Err(attempt) => return attempt,
        };

        let start = Instant::now();
        if let Err(e) = proc.send(&WorkRequest::Build(task.clone())) {
            debug!(slot = self.slot, error = %e, "Send failed");
            return Attempt::Crashed(self.bury());
        }

        let response = match proc.recv() {
            Ok(Some(response)) => response,
            Ok(None) => return Attempt::Crashed(self.bury()),
            Err(e) => {
                warn!(slot = self.slot, error = %e, "Unreadable worker response");
                if let Some(mut proc) = self.proc.take() {
                    let _ = proc.kill();
                }
                self.shared.update_slot(self.slot, |s| s.pid = None);
                return Attempt::Crashed(TerminationReason::Unknown);
            }
        };

        let Some(result) = response.into_result() else {
            return Attempt::Done(Err(BuildError::Worker(format!(
                "Worker in slot {} sent ready instead of a result",
                self.slot
            ))));
        };
        trace!(
            slot = self.slot,
            index = task.index,
            ok = result.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Worker result"
        );

        self.calls += 1;
        self.shared.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.await_ready();
        Attempt::Done(result)
    }

    /// Consume the `ready` that follows every result.
    fn await_ready(&mut self) {
        let Some(proc) = self.proc.as_mut() else {
            return;
        };
        match proc.recv() {
            Ok(Some(WorkResponse::Ready)) => {}
            Ok(None) => {
                // Exited after reporting, which is how workers end on shutdown.
                self.bury();
            }
            other => {
                warn!(slot = self.slot, response = ?other, "Expected ready from worker");
                self.retire();
            }
        }
    }

    /// Drop a worker whose pipe closed and report why it went away.
    fn bury(&mut self) -> TerminationReason {
        self.shared.update_slot(self.slot, |s| s.pid = None);
        match self.proc.take() {
            Some(mut proc) => proc.termination_reason(REAP_TIMEOUT),
            None => TerminationReason::Unknown,
        }
    }

    /// Stop the current worker; the next task spawns a replacement.
    fn retire(&mut self) {
        if let Some(mut proc) = self.proc.take() {
            debug!(slot = self.slot, pid = %proc.pid(), calls = self.calls, "Retiring worker");
            let _ = proc.stop(self.config.shutdown_grace);
            self.shared.counters.retired.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.update_slot(self.slot, |s| s.pid = None);
    }

    fn reached_call_limit(&self) -> bool {
        self.proc.is_some()
            && self
                .config
                .max_calls_per_worker
                .is_some_and(|limit| self.calls >= limit)
    }
}

fn slot_loop(mut worker: Worker, queue: Receiver<Job>) {
    while let Ok(job) = queue.recv() {
        let index = job.task.index;
        if worker.shared.is_shutting_down() {
            job.reject(BuildError::PoolShutDown { index });
            continue;
        }

        worker.shared.update_slot(worker.slot, |s| s.busy = true);
        let result = worker.run(&job.task);
        worker.shared.update_slot(worker.slot, |s| s.busy = false);
        job.completer.complete(result);

        if worker.reached_call_limit() {
            worker.retire();
        }
    }

    // Queue closed: the pool is shutting down.
    if let Some(mut proc) = worker.proc.take() {
        let _ = proc.stop(worker.config.shutdown_grace);
    }
    worker.shared.update_slot(worker.slot, |s| s.pid = None);
}

/// A pool of worker processes.
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    shared: Arc<Shared>,
    queue_tx: Mutex<Option<Sender<Job>>>,
    queue_rx: Receiver<Job>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create the pool. Worker processes are spawned on first use.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(BuildError::Validation(
                "worker pool needs at least one worker".into(),
            ));
        }
        info!(
            workers = config.worker_count,
            max_retries = config.max_retries,
            max_calls_per_worker = ?config.max_calls_per_worker,
            "Initializing worker pool"
        );

        let config = Arc::new(config);
        let shared = Arc::new(Shared {
            shutting_down: AtomicBool::new(false),
            slots: (0..config.worker_count)
                .map(|_| Mutex::new(SlotStatus::default()))
                .collect(),
            counters: Counters::default(),
        });
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<Job>();

        let mut threads = Vec::with_capacity(config.worker_count);
        for slot in 0..config.worker_count {
            let worker = Worker::new(slot, config.clone(), shared.clone());
            let queue = queue_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("parabuild-slot-{}", slot))
                .spawn(move || slot_loop(worker, queue))?;
            threads.push(handle);
        }

        Ok(Self {
            config,
            shared,
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx,
            threads: Mutex::new(threads),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Queue a task. Never blocks; after shutdown the handle resolves at once
    /// with [`BuildError::PoolShutDown`].
    pub fn submit(&self, task: Task) -> TaskHandle {
        let index = task.index;
        let (completer, handle) = TaskHandle::channel(index);
        let job = Job { task, completer };

        let sender = self.queue_tx.lock().ok().and_then(|tx| tx.clone());
        match sender {
            Some(tx) => {
                if let Err(crossbeam_channel::SendError(job)) = tx.send(job) {
                    job.reject(BuildError::PoolShutDown { index });
                }
            }
            None => job.reject(BuildError::PoolShutDown { index }),
        }
        handle
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Stop every worker and resolve everything still pending. Idempotent.
    ///
    /// Queued tasks resolve with [`BuildError::PoolShutDown`]. Busy workers get
    /// SIGTERM and report a terminated result; any still alive after the
    /// grace window are killed.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down worker pool");

        let sender = self.queue_tx.lock().ok().and_then(|mut tx| tx.take());
        while let Ok(job) = self.queue_rx.try_recv() {
            let index = job.task.index;
            job.reject(BuildError::PoolShutDown { index });
        }
        drop(sender);

        self.shared.signal_slots(Signal::SIGTERM, true);

        let threads: Vec<JoinHandle<()>> = match self.threads.lock() {
            Ok(mut threads) => threads.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let deadline = Instant::now() + self.config.shutdown_grace;
        while Instant::now() < deadline && threads.iter().any(|t| !t.is_finished()) {
            std::thread::sleep(Duration::from_millis(10));
        }
        if threads.iter().any(|t| !t.is_finished()) {
            warn!("Workers did not stop within the grace period, killing");
            self.shared.signal_slots(Signal::SIGKILL, false);
        }
        for thread in threads {
            let _ = thread.join();
        }
        debug!(stats = ?self.stats(), "Worker pool shut down");
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let counters = &self.shared.counters;
        WorkerPoolStats {
            worker_count: self.config.worker_count,
            workers_spawned: counters.spawned.load(Ordering::Relaxed),
            tasks_completed: counters.completed.load(Ordering::Relaxed),
            workers_retired: counters.retired.load(Ordering::Relaxed),
            crashes: counters.crashes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    /// Worker processes started, including replacements.
    pub workers_spawned: usize,
    /// Tasks that produced a result (success or failure).
    pub tasks_completed: usize,
    /// Workers replaced after reaching the call limit.
    pub workers_retired: usize,
    /// Worker processes that died mid-task.
    pub crashes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh_worker(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    fn config(command: WorkerCommand) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: 1,
            max_retries: 0,
            max_calls_per_worker: None,
            shutdown_grace: Duration::from_secs(2),
            command,
        }
    }

    fn task(index: usize) -> Task {
        Task::inline(json!({"command": "true"}).as_object().cloned().unwrap(), index, 1)
    }

    /// A worker that answers every build with a fixed result.
    const ECHO_WORKER: &str = r#"
        echo '{"type":"ready"}'
        while read line; do
            case "$line" in
                *'"exit"'*) exit 0 ;;
            esac
            echo '{"type":"result","index":0,"payload":"ok"}'
            echo '{"type":"ready"}'
        done
    "#;

    #[test]
    fn test_config_from_options() {
        let options = RunOptions {
            max_concurrent_workers: Some(3),
            max_retries: 2,
            max_calls_per_worker: Some(10),
            ..Default::default()
        };
        let config = WorkerPoolConfig::from_options(&options, WorkerCommand::new("w"));
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_calls_per_worker, Some(10));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut cfg = config(sh_worker(ECHO_WORKER));
        cfg.worker_count = 0;
        assert!(matches!(
            WorkerPool::new(cfg),
            Err(BuildError::Validation(_))
        ));
    }

    #[test]
    fn test_submit_and_result() {
        let pool = WorkerPool::new(config(sh_worker(ECHO_WORKER))).unwrap();
        let handles: Vec<_> = (0..3).map(|i| pool.submit(task(i))).collect();
        for handle in handles {
            assert_eq!(handle.wait().unwrap(), json!("ok"));
        }
        let stats = pool.stats();
        assert_eq!(stats.tasks_completed, 3);
        assert_eq!(stats.workers_spawned, 1);
        pool.shutdown();
    }

    #[test]
    fn test_call_limit_recycles_worker() {
        let mut cfg = config(sh_worker(ECHO_WORKER));
        cfg.max_calls_per_worker = Some(1);
        let pool = WorkerPool::new(cfg).unwrap();
        for i in 0..3 {
            pool.submit(task(i)).wait().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.workers_spawned, 3);
        assert!(stats.workers_retired >= 2);
    }

    #[test]
    fn test_crash_without_retries_fails_immediately() {
        let crashing = r#"echo '{"type":"ready"}'; read line; kill -9 $$"#;
        let pool = WorkerPool::new(config(sh_worker(crashing))).unwrap();
        let err = pool.submit(task(0)).wait().unwrap_err();
        match err {
            BuildError::WorkerCrashed { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("Expected WorkerCrashed, got {other:?}"),
        }
        assert_eq!(pool.stats().crashes, 1);
    }

    #[test]
    fn test_crash_is_retried_up_to_max_retries() {
        let crashing = r#"echo '{"type":"ready"}'; read line; kill -9 $$"#;
        let mut cfg = config(sh_worker(crashing));
        cfg.max_retries = 2;
        let pool = WorkerPool::new(cfg).unwrap();
        let err = pool.submit(task(0)).wait().unwrap_err();
        match err {
            BuildError::WorkerCrashed { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("SIGKILL"));
            }
            other => panic!("Expected WorkerCrashed, got {other:?}"),
        }
        assert_eq!(pool.stats().workers_spawned, 3);
    }

    #[test]
    fn test_crash_before_ready_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let starts = dir.path().join("starts");
        let script = format!("echo x >> '{}'; kill -9 $$", starts.display());
        let mut cfg = config(sh_worker(&script));
        cfg.max_retries = 2;
        let pool = WorkerPool::new(cfg).unwrap();

        let err = pool.submit(task(0)).wait().unwrap_err();
        match err {
            BuildError::WorkerCrashed { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("SIGKILL"));
            }
            other => panic!("Expected WorkerCrashed, got {other:?}"),
        }
        assert_eq!(pool.stats().crashes, 3);
        assert_eq!(std::fs::read_to_string(&starts).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_spawn_failure_is_not_retried() {
        let mut cfg = config(WorkerCommand::new("/nonexistent/parabuild-worker"));
        cfg.max_retries = 2;
        let pool = WorkerPool::new(cfg).unwrap();
        let err = pool.submit(task(0)).wait().unwrap_err();
        assert!(!err.is_crash(), "got {err:?}");
        assert_eq!(pool.stats().crashes, 0);
    }

    #[test]
    fn test_submit_after_shutdown_resolves() {
        let pool = WorkerPool::new(config(sh_worker(ECHO_WORKER))).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());
        let err = pool.submit(task(4)).wait().unwrap_err();
        assert!(matches!(err, BuildError::PoolShutDown { index: 4 }));
    }

    #[test]
    fn test_shutdown_resolves_queued_and_running_tasks() {
        // Never answers a build, and ignores SIGTERM so the pool must kill it.
        let stuck = r#"trap '' TERM; echo '{"type":"ready"}'; read line; while true; do sleep 1; done"#;
        let mut cfg = config(sh_worker(stuck));
        cfg.shutdown_grace = Duration::from_millis(300);
        let pool = WorkerPool::new(cfg).unwrap();

        let running = pool.submit(task(0));
        let queued = pool.submit(task(1));
        std::thread::sleep(Duration::from_millis(300));
        pool.shutdown();

        assert!(running.wait().unwrap_err().is_shutdown());
        assert!(matches!(
            queued.wait().unwrap_err(),
            BuildError::PoolShutDown { index: 1 }
        ));
    }
}
