//! Command-line interface definitions using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use parabuild::config::LoadContext;
use parabuild::options::RunOptions;

/// Run a set of build configurations in parallel worker processes.
#[derive(Parser, Debug)]
#[command(name = "parabuild")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (".json" is appended if the path does not exist).
    #[arg(short, long, env = "PARABUILD_CONFIG", default_value = "build.json")]
    pub config: PathBuf,

    /// Keep re-running every target when its watched files change.
    #[arg(short, long)]
    pub watch: bool,

    /// Maximum number of worker processes [default: number of CPUs].
    #[arg(short, long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Extra attempts for a target whose worker crashed.
    #[arg(short = 'm', long, default_value_t = 0, value_name = "N")]
    pub max_retries: usize,

    /// Replace a worker after it has built this many targets.
    #[arg(long, value_name = "N")]
    pub max_calls_per_worker: Option<usize>,

    /// Stop at the first failing target instead of waiting for all.
    #[arg(long)]
    pub bail: bool,

    /// Print the results as JSON on stdout and suppress progress notices.
    #[arg(long)]
    pub json: bool,

    /// How often watching workers poll for changes, in milliseconds.
    #[arg(long, default_value_t = 500, value_name = "MS")]
    pub watch_interval_ms: u64,

    /// Fail when no watch cycle completes within this many seconds.
    #[arg(long, value_name = "SECS")]
    pub watch_timeout_secs: Option<u64>,

    /// Seconds a shutdown may take before workers are killed.
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    pub shutdown_grace_secs: u64,

    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Run as a worker process (spawned by parabuild itself).
    #[arg(long, hide = true)]
    pub internal_worker: bool,

    /// Arguments for the configuration, e.g. `-- --env.mode=production`.
    #[arg(last = true, value_name = "CONFIG_ARGS")]
    pub config_args: Vec<String>,
}

impl Cli {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_concurrent_workers: self.parallel,
            max_retries: self.max_retries,
            max_calls_per_worker: self.max_calls_per_worker,
            bail: self.bail,
            json: self.json,
            watch: self.watch,
            watch_interval: Duration::from_millis(self.watch_interval_ms),
            watch_timeout: self.watch_timeout_secs.map(Duration::from_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            context: LoadContext::from_args(self.config_args.iter().cloned()),
        }
    }
}
