//! Diagnostic logging for the coordinator and its workers.
//!
//! Progress notices (`[BUILD] ...`) are not logs; see [`crate::theme`].
//! Logs go to stderr, and optionally to a file as well. Worker processes
//! share the coordinator's stderr, so their logs interleave with it.
//!
//! # Environment Variables
//!
//! - `PARABUILD_LOG` - Log filter (overrides RUST_LOG)
//! - `PARABUILD_LOG_LEVEL` - Log level: off, error, warn, info, debug, trace
//! - `PARABUILD_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PARABUILD_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use parabuild::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Environment variable holding the log filter; also how workers inherit it.
pub const LOG_ENV: &str = "PARABUILD_LOG";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable format
    Pretty,
    /// Single-line format (default)
    #[default]
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level directive, e.g. `warn` or `off` (default: warn)
    pub level: String,
    /// Log format (default: Compact)
    pub format: LogFormat,
    /// Path to log file (None = stderr only). Never rotated.
    pub file_path: Option<PathBuf>,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            file_path: None,
            span_events: false,
            filter: None,
            show_target: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level from the CLI's `-v`/`-q` counts.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, 2) => "debug",
            (false, _) => "trace",
        };
        Self::default().with_level(level)
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_lowercase();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set (from the CLI) is kept; otherwise `PARABUILD_LOG`,
    /// then `RUST_LOG`, then `PARABUILD_LOG_LEVEL` decide.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var(LOG_ENV) {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("PARABUILD_LOG_LEVEL")
            && let Some(level) = parse_level(&level)
        {
            self.level = level.to_string();
        }

        if let Ok(format) = std::env::var("PARABUILD_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("PARABUILD_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Whether anything was configured explicitly, through a filter or
    /// `PARABUILD_LOG_LEVEL`.
    pub fn is_explicit(&self) -> bool {
        self.filter.is_some() || std::env::var("PARABUILD_LOG_LEVEL").is_ok()
    }

    /// The effective filter directive, for passing on to worker processes.
    pub fn directive(&self) -> String {
        self.filter.clone().unwrap_or_else(|| self.level.clone())
    }

    fn build_filter(&self) -> EnvFilter {
        let directive = self.directive();
        EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            eprintln!("Warning: Invalid log filter '{}', using default", directive);
            EnvFilter::new(&self.level)
        })
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// A formatting layer for `writer` in the configured format.
    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<&'static str> {
    match s.to_lowercase().as_str() {
        "off" | "none" => Some("off"),
        "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

/// Initialize the global tracing subscriber: stderr, plus the log file if
/// one is configured.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, crate::theme::colors_enabled())];

    if let Some(path) = &config.file_path {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("parabuild.log");
        let appender = RollingFileAppender::new(Rotation::NEVER, parent, file_name);
        layers.push(config.layer(appender, false));
    }

    let result = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some("warn"));
        assert_eq!(parse_level("OFF"), Some("off"));
        assert_eq!(parse_level("trace"), Some("trace"));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LogConfig::from_verbosity(0, false).level, "warn");
        assert_eq!(LogConfig::from_verbosity(1, false).level, "info");
        assert_eq!(LogConfig::from_verbosity(2, false).level, "debug");
        assert_eq!(LogConfig::from_verbosity(7, false).level, "trace");
        assert_eq!(LogConfig::from_verbosity(3, true).level, "error");
    }

    #[test]
    fn test_filter_wins_over_level() {
        let config = LogConfig::new()
            .with_level("info")
            .with_filter("parabuild::pool=trace".into());
        assert_eq!(config.directive(), "parabuild::pool=trace");
        assert_eq!(LogConfig::new().with_level("DEBUG").directive(), "debug");
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_file(PathBuf::from("/tmp/parabuild.log"));
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/parabuild.log")));
    }
}
