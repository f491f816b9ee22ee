//! parabuild - parallel build runner

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;
use parabuild::logging::{self, LOG_ENV, LogConfig};
use parabuild::{RunOutcome, ShutdownCoordinator, WorkerCommand, theme};

/// Program entry point: parses CLI arguments, runs the build or the worker
/// loop, and handles top-level errors.
///
/// On error prints a colored error header followed by each cause in the
/// error chain before exiting with status code 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    if cli.internal_worker {
        // Filter and format come from the coordinator through the environment.
        parabuild::run_as_worker();
    }

    if let Err(e) = run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let options = cli.run_options();

    let mut log_config = LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    if options.silent() && cli.verbose == 0 && !log_config.is_explicit() {
        log_config = log_config.with_level("off");
    }
    let directive = log_config.directive();
    logging::init(log_config);

    let coordinator = ShutdownCoordinator::new(options.shutdown_grace * 2);
    if let Err(e) = parabuild::shutdown::install_signal_handler(&coordinator) {
        tracing::warn!(error = %e, "Running without a signal handler");
    }
    let mut command = WorkerCommand::current_exe()?.env(LOG_ENV, directive);
    if cli.no_color {
        command = command.arg("--no-color");
    }

    let outcome = parabuild::run_with(&cli.config, &options, &coordinator, command)
        .with_context(|| format!("Build of {} did not succeed", cli.config.display()))?;

    if options.json {
        let json = match outcome {
            RunOutcome::Built(results) => serde_json::Value::Array(results),
            RunOutcome::Watched { cycles } => serde_json::json!({ "cycles": cycles }),
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Ok(())
}
