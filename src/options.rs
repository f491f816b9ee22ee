//! Run options shared by the library entry points and the CLI.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LoadContext;
use crate::error::{BuildError, Result};

/// Options recognised by [`crate::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunOptions {
    /// Worker process cap (default: available parallelism).
    pub max_concurrent_workers: Option<usize>,
    /// Extra attempts for a task whose worker crashed.
    pub max_retries: usize,
    /// Tasks a worker completes before it is replaced (default: unbounded).
    pub max_calls_per_worker: Option<usize>,
    /// Stop waiting at the first failure.
    pub bail: bool,
    /// Silent mode: structured results only, no progress notices.
    pub json: bool,
    /// Keep re-running every task until shut down.
    pub watch: bool,
    /// How often a watching worker polls for changes.
    #[serde(with = "millis")]
    pub watch_interval: Duration,
    /// Fail a watch run when no cycle completes within this long.
    #[serde(with = "opt_millis")]
    pub watch_timeout: Option<Duration>,
    /// How long a shutdown may take before processes are killed.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
    /// Pass-through arguments for the configuration loader.
    pub context: LoadContext,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workers: None,
            max_retries: 0,
            max_calls_per_worker: None,
            bail: false,
            json: false,
            watch: false,
            watch_interval: Duration::from_millis(500),
            watch_timeout: None,
            shutdown_grace: Duration::from_secs(5),
            context: LoadContext::default(),
        }
    }
}

impl RunOptions {
    /// Reject malformed options before any worker is started.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.max_concurrent_workers == Some(0) {
            problems.push("maxConcurrentWorkers should be >= 1");
        }
        if self.max_calls_per_worker == Some(0) {
            problems.push("maxCallsPerWorker should be >= 1");
        }
        if self.watch_interval.is_zero() {
            problems.push("watchInterval should be > 0");
        }
        if self.shutdown_grace.is_zero() {
            problems.push("shutdownGrace should be > 0");
        }
        if self.watch_timeout.is_some_and(|t| t.is_zero()) {
            problems.push("watchTimeout should be > 0");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Validation(problems.join("; ")))
        }
    }

    /// Whether human-facing notices are suppressed.
    pub fn silent(&self) -> bool {
        self.json
    }

    /// Effective worker cap.
    pub fn worker_count(&self) -> usize {
        self.max_concurrent_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = RunOptions::default();
        assert_eq!(options.max_retries, 0);
        assert!(options.max_calls_per_worker.is_none());
        assert!(!options.bail);
        assert!(!options.silent());
        assert!(options.worker_count() >= 1);
        options.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let options = RunOptions {
            max_concurrent_workers: Some(0),
            max_calls_per_worker: Some(0),
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("maxConcurrentWorkers"));
        assert!(msg.contains("maxCallsPerWorker"));
    }

    #[test]
    fn test_deserialize_camel_case() {
        let options: RunOptions = serde_json::from_value(json!({
            "maxConcurrentWorkers": 3,
            "maxRetries": 2,
            "bail": true,
            "json": true,
            "watchTimeout": 1500
        }))
        .unwrap();
        assert_eq!(options.worker_count(), 3);
        assert_eq!(options.max_retries, 2);
        assert!(options.bail);
        assert!(options.silent());
        assert_eq!(options.watch_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.watch_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_malformed_option_type_fails_to_parse() {
        let result = serde_json::from_value::<RunOptions>(json!({"maxConcurrentWorkers": "fail"}));
        assert!(result.is_err());
    }
}
