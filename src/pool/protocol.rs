//! IPC protocol between the pool and its worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. A worker announces
//! `ready` on startup and after every response; the pool sends one `build`
//! at a time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BuildError, BuildResult, Failure};
use crate::task::Task;

/// Request from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Run one task.
    Build(Task),
    /// Graceful shutdown request.
    Exit,
}

/// Response from a worker to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Worker is ready for work.
    Ready,
    /// The task succeeded.
    Result { index: usize, payload: Value },
    /// The task failed.
    Error { index: usize, failure: Failure },
}

impl WorkResponse {
    /// Encode a task outcome.
    pub fn from_result(index: usize, result: &BuildResult) -> Self {
        match result {
            Ok(payload) => Self::Result {
                index,
                payload: payload.clone(),
            },
            Err(e) => Self::Error {
                index,
                failure: e.to_failure(),
            },
        }
    }

    /// Decode a task outcome. `None` for `Ready`.
    pub fn into_result(self) -> Option<BuildResult> {
        match self {
            Self::Ready => None,
            Self::Result { payload, .. } => Some(Ok(payload)),
            Self::Error { index, failure } => Some(Err(BuildError::from_failure(index, failure))),
        }
    }
}
