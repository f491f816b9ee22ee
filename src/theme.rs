//! Colored progress notices for build output.
//!
//! Notices are the human-facing `[BUILD]` lines on stderr; diagnostics go
//! through `tracing` instead. Callers decide whether to emit a notice at all
//! (silent mode suppresses them).
//!
//! # NO_COLOR Support
//!
//! Colors can be disabled globally via:
//! - The `--no-color` CLI flag
//! - The `NO_COLOR` environment variable

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global color enable flag (respects NO_COLOR and --no-color).
static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Prefix on every progress notice.
pub const NOTICE_PREFIX: &str = "[BUILD]";

/// Disable all colors globally.
///
/// Call this early in main() when --no-color is set.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

/// Check if colors are currently enabled.
pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Severity of a progress notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

/// Semantic styles via owo_colors, respecting the global color switch.
pub trait Themed: owo_colors::OwoColorize {
    /// Target names (cyan).
    fn target(&self) -> String
    where
        Self: Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::cyan(self))
        } else {
            self.to_string()
        }
    }

    /// Durations and counts (bold).
    fn count(&self) -> String
    where
        Self: Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::bold(self))
        } else {
            self.to_string()
        }
    }

    /// Error text (red).
    fn error_style(&self) -> String
    where
        Self: Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::red(self))
        } else {
            self.to_string()
        }
    }

    /// Warning text (yellow).
    fn warning(&self) -> String
    where
        Self: Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::yellow(self))
        } else {
            self.to_string()
        }
    }

    /// Success text (green).
    fn success(&self) -> String
    where
        Self: Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::green(self))
        } else {
            self.to_string()
        }
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for usize {}
impl Themed for u64 {}

/// Render a notice line, without the trailing newline.
pub fn format_notice(level: Level, message: &str) -> String {
    let prefix = match level {
        Level::Info => NOTICE_PREFIX.to_string(),
        Level::Success => NOTICE_PREFIX.success(),
        Level::Warning => NOTICE_PREFIX.warning(),
        Level::Error => NOTICE_PREFIX.error_style(),
    };
    let message = match level {
        Level::Error => message.error_style(),
        _ => message.to_string(),
    };
    format!("{} {}", prefix, message)
}

/// Print a notice to stderr.
pub fn notice(level: Level, message: &str) {
    eprintln!("{}", format_notice(level, message));
}

pub fn info(message: &str) {
    notice(Level::Info, message);
}

pub fn success(message: &str) {
    notice(Level::Success, message);
}

pub fn warning(message: &str) {
    notice(Level::Warning, message);
}

pub fn error(message: &str) {
    notice(Level::Error, message);
}

/// `word` as written for `count` of them: "1 target", "3 targets".
pub fn pluralize(word: &str, count: usize) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}

/// Seconds with one decimal, as shown in notices.
pub fn seconds(elapsed: std::time::Duration) -> String {
    format!("{:.1}", elapsed.as_secs_f64())
}
