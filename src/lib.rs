//! parabuild - run independent build configurations in parallel.
//!
//! A configuration file describes one or more build targets. Each target is
//! handed to a pool of worker processes; the results come back in
//! configuration order. Variant documents are expanded into the cartesian
//! product of their axes first (see [`variants`]).
//!
//! [`run`] re-executes the current binary as its workers, so a program that
//! calls it must hand worker invocations to [`worker_hook`] first:
//!
//! ```no_run
//! use std::path::Path;
//! use parabuild::{RunOptions, RunOutcome};
//!
//! fn main() -> parabuild::Result<()> {
//!     // Never returns in a worker process.
//!     parabuild::worker_hook();
//!
//!     let options = RunOptions {
//!         max_concurrent_workers: Some(4),
//!         bail: true,
//!         ..Default::default()
//!     };
//!     if let RunOutcome::Built(results) = parabuild::run(Path::new("build.json"), &options)? {
//!         println!("{} targets built", results.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! To use a different worker program, pass a [`WorkerCommand`] to
//! [`run_with`].

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod options;
pub mod orchestrator;
pub mod pool;
pub mod shutdown;
pub mod task;
pub mod theme;
pub mod variants;
pub mod watch;

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

pub use config::{ConfigSet, Configuration, LoadContext, find_config_file, load_config};
pub use error::{BuildError, BuildResult, Result};
pub use executor::{CommandExecutor, TaskExecutor};
pub use options::RunOptions;
pub use orchestrator::{Dispatch, WatchHooks, run_builds, run_watch};
pub use pool::{INTERNAL_WORKER_FLAG, WorkerCommand, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
pub use shutdown::{ShutdownCoordinator, ShutdownState};
pub use variants::{VariantSpec, generate};

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// One result per configuration, in configuration order.
    Built(Vec<Value>),
    /// Watch mode ended after this many completed cycles.
    Watched { cycles: u64 },
}

/// Whether `args` (program name first) are those of a spawned worker.
pub fn is_worker_invocation<I>(args: I) -> bool
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter().skip(1).any(|arg| arg == INTERNAL_WORKER_FLAG)
}

/// Serve as a pool worker with the default [`CommandExecutor`].
///
/// Logging is configured from the environment the coordinator passed down.
pub fn run_as_worker() -> ! {
    logging::init(logging::LogConfig::default().with_env_overrides());
    pool::run_worker_main(Arc::new(CommandExecutor::new()))
}

/// Turn this process into a worker if it was spawned as one by [`run`].
///
/// Returns immediately in any other process. Call it at the top of `main`
/// before anything else that could start builds.
pub fn worker_hook() {
    let args: Vec<OsString> = std::env::args_os().collect();
    if is_worker_invocation(args.iter().cloned()) {
        if args.iter().any(|arg| arg == "--no-color") {
            theme::disable_colors();
        }
        run_as_worker();
    }
}

/// Build the configuration file at `config_path` with the current executable
/// as the worker program, stopping on SIGINT/SIGTERM.
///
/// Workers are started as `<current exe> --internal-worker`; the program
/// must route that to [`worker_hook`] (or [`run_as_worker`]). Calling `run`
/// from inside a worker process is rejected, so a program without the hook
/// fails its builds instead of spawning pools recursively.
pub fn run(config_path: &Path, options: &RunOptions) -> Result<RunOutcome> {
    if is_worker_invocation(std::env::args_os()) {
        return Err(BuildError::Validation(format!(
            "parabuild::run called inside a worker process; call parabuild::worker_hook() \
             before it to handle {}",
            INTERNAL_WORKER_FLAG
        )));
    }
    let coordinator = ShutdownCoordinator::new(options.shutdown_grace * 2);
    if let Err(e) = shutdown::install_signal_handler(&coordinator) {
        warn!(error = %e, "Running without a signal handler");
    }
    run_with(config_path, options, &coordinator, WorkerCommand::current_exe()?)
}

/// [`run`] with an explicit shutdown coordinator and worker program.
///
/// Configuration problems and invalid options are reported before any
/// worker process starts. The pool is always shut down before returning.
pub fn run_with(
    config_path: &Path,
    options: &RunOptions,
    coordinator: &ShutdownCoordinator,
    command: WorkerCommand,
) -> Result<RunOutcome> {
    let start = Instant::now();
    options.validate()?;
    let configs = load_config(config_path, &options.context)?;
    let resolved = find_config_file(config_path)?;
    info!(path = %resolved.display(), targets = configs.len(), "Loaded configuration");

    let pool_config = WorkerPoolConfig::from_options(options, command);
    if options.watch && pool_config.worker_count < configs.len() {
        // Watch tasks never finish, so targets beyond the pool size never start.
        warn!(
            workers = pool_config.worker_count,
            targets = configs.len(),
            "Fewer workers than targets in watch mode; some targets will not run"
        );
    }
    let pool = WorkerPool::new(pool_config)?;
    let stop = coordinator.notified();

    let result = if options.watch {
        watch::WatchServer::bind_temp().and_then(|server| {
            let silent = options.silent();
            let hooks = WatchHooks {
                on_cycle: Box::new(move |cycle| {
                    if !silent {
                        theme::success(&format!("Watch cycle {} complete", cycle));
                    }
                }),
                on_progress: Box::new(|index| info!(index, "Target finished a watch cycle")),
            };
            run_watch(&configs, Some(&resolved), options, &pool, &server, &stop, hooks)
                .map(|cycles| RunOutcome::Watched { cycles })
        })
    } else {
        run_builds(&configs, Some(&resolved), options, &pool, &stop).map(RunOutcome::Built)
    };

    pool.shutdown();
    if !options.silent() {
        let elapsed = theme::seconds(start.elapsed());
        match &result {
            Ok(_) => theme::success(&format!("Finished build after {} seconds", elapsed)),
            Err(_) => theme::error(&format!("Build failed after {} seconds", elapsed)),
        }
    }
    coordinator.complete();
    result
}
