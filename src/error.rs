//! Error types for parabuild.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for parabuild.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Could not load configuration file {path}: {message}")]
    ConfigLoad { path: PathBuf, message: String },

    #[error("Configuration file {0} does not exist")]
    ConfigNotFound(PathBuf),

    #[error("Options validation failed: {0}")]
    Validation(String),

    #[error("{message}")]
    TaskFailed {
        index: usize,
        message: String,
        diagnostics: Option<String>,
    },

    #[error("Worker crashed while building target {index} after {attempts} attempt(s): {reason}")]
    WorkerCrashed {
        index: usize,
        attempts: usize,
        reason: String,
    },

    #[error(
        "There is a difference between the amount of the provided configs: expected {expected}, \
         loaded {actual} for target {index}. Maybe you were expecting command line arguments to be \
         passed to your configuration. If so, separate them with a -- from the parabuild options."
    )]
    DispatchMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Target {index} terminated: {reason}")]
    Terminated { index: usize, reason: String },

    #[error("Worker pool shut down before target {index} completed")]
    PoolShutDown { index: usize },

    #[error("No watch cycle completed within {0:?}")]
    WatchTimeout(Duration),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    /// Target index this error belongs to, if it is a per-task failure.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::TaskFailed { index, .. }
            | Self::WorkerCrashed { index, .. }
            | Self::DispatchMismatch { index, .. }
            | Self::Terminated { index, .. }
            | Self::PoolShutDown { index } => Some(*index),
            _ => None,
        }
    }

    /// True for failures caused by a shutdown rather than by the build itself.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::PoolShutDown { .. })
    }

    /// True when a worker process died instead of reporting a result.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::WorkerCrashed { .. })
    }

    /// Rebuild a per-task error from its wire form.
    pub fn from_failure(index: usize, failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Task => Self::TaskFailed {
                index,
                message: failure.message,
                diagnostics: failure.diagnostics,
            },
            FailureKind::ConfigLoad => Self::ConfigLoad {
                path: failure.diagnostics.map(PathBuf::from).unwrap_or_default(),
                message: failure.message,
            },
            FailureKind::DispatchMismatch { expected, actual } => Self::DispatchMismatch {
                index,
                expected,
                actual,
            },
            FailureKind::Terminated => Self::Terminated {
                index,
                reason: failure.message,
            },
        }
    }

    /// Convert a per-task error to its wire form. Errors that only exist on
    /// the coordinator side are flattened into task failures.
    pub fn to_failure(&self) -> Failure {
        match self {
            Self::TaskFailed {
                message,
                diagnostics,
                ..
            } => Failure {
                kind: FailureKind::Task,
                message: message.clone(),
                diagnostics: diagnostics.clone(),
            },
            Self::ConfigLoad { path, message } => Failure {
                kind: FailureKind::ConfigLoad,
                message: message.clone(),
                diagnostics: Some(path.display().to_string()),
            },
            Self::DispatchMismatch {
                expected, actual, ..
            } => Failure {
                kind: FailureKind::DispatchMismatch {
                    expected: *expected,
                    actual: *actual,
                },
                message: self.to_string(),
                diagnostics: None,
            },
            Self::Terminated { reason, .. } => Failure {
                kind: FailureKind::Terminated,
                message: reason.clone(),
                diagnostics: None,
            },
            other => Failure {
                kind: FailureKind::Task,
                message: other.to_string(),
                diagnostics: None,
            },
        }
    }
}

/// Category of a failure reported by a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The unit of work itself failed.
    Task,
    /// The worker could not load the configuration file.
    ConfigLoad,
    /// The worker loaded a different number of configurations.
    DispatchMismatch { expected: usize, actual: usize },
    /// The worker was asked to stop before finishing.
    Terminated,
}

/// A failure as it travels over the worker pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// Result type alias for parabuild operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Outcome of a single build task: an opaque success payload or a failure.
pub type BuildResult = std::result::Result<serde_json::Value, BuildError>;
