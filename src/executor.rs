//! The unit of work a worker performs for one configuration.

use std::collections::BTreeSet;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Instant;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Value, json};

use crate::config::Configuration;
use crate::error::{BuildError, BuildResult};

/// Executes a single configuration inside a worker process.
pub trait TaskExecutor: Send + Sync {
    /// Run the task for `config`, the `index`-th of `expected_count` configurations.
    fn execute(&self, config: &Configuration, index: usize, expected_count: usize) -> BuildResult;

    /// Ask anything started by [`TaskExecutor::execute`] to stop.
    fn cancel(&self) {}
}

/// Display name of a configuration: its `name`, else its `command`.
pub fn app_name(config: &Configuration) -> String {
    config
        .get("name")
        .or_else(|| config.get("command"))
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string()
}

/// Runs the configuration's `command` field through `sh -c`.
///
/// Recognised fields: `command` (required), `name`, `cwd`, and `env` (an
/// object of string values). Output is captured because the worker's own
/// stdout carries the IPC protocol.
#[derive(Debug, Default)]
pub struct CommandExecutor {
    running: Mutex<BTreeSet<u32>>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn command_for(config: &Configuration, index: usize) -> Result<Command, BuildError> {
        let script = config
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::TaskFailed {
                index,
                message: format!(
                    "[BUILD] Configuration {} has no \"command\" string",
                    app_name(config)
                ),
                diagnostics: None,
            })?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(cwd) = config.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = config.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                match value {
                    Value::String(s) => cmd.env(key, s),
                    other => cmd.env(key, other.to_string()),
                };
            }
        }
        Ok(cmd)
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, config: &Configuration, index: usize, _expected_count: usize) -> BuildResult {
        let name = app_name(config);
        let mut cmd = Self::command_for(config, index)?;

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| BuildError::TaskFailed {
            index,
            message: format!("[BUILD] Failed to start {}: {}", name, e),
            diagnostics: None,
        })?;
        let pid = child.id();
        if let Ok(mut running) = self.running.lock() {
            running.insert(pid);
        }

        let output = child.wait_with_output();

        if let Ok(mut running) = self.running.lock() {
            running.remove(&pid);
        }
        let output = output?;
        let elapsed = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        tracing::debug!(
            index,
            name = %name,
            status = %output.status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Command finished"
        );

        if output.status.success() {
            Ok(json!({
                "name": name,
                "index": index,
                "elapsed_ms": elapsed.as_millis() as u64,
                "stdout": stdout,
            }))
        } else {
            Err(BuildError::TaskFailed {
                index,
                message: format!("[BUILD] Errors building {} ({})", name, output.status),
                diagnostics: (!stderr.is_empty()).then_some(stderr),
            })
        }
    }

    fn cancel(&self) {
        let Ok(running) = self.running.lock() else {
            return;
        };
        for pid in running.iter() {
            tracing::debug!(pid, "Terminating running command");
            let _ = signal::kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Configuration {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_app_name_prefers_name() {
        assert_eq!(app_name(&config(json!({"name": "web", "command": "x"}))), "web");
        assert_eq!(app_name(&config(json!({"command": "make all"}))), "make all");
        assert_eq!(app_name(&Configuration::new()), "<unnamed>");
    }

    #[test]
    fn test_successful_command_captures_stdout() {
        let executor = CommandExecutor::new();
        let result = executor
            .execute(&config(json!({"name": "hello", "command": "echo hi"})), 0, 1)
            .unwrap();
        assert_eq!(result["name"], json!("hello"));
        assert_eq!(result["stdout"], json!("hi\n"));
    }

    #[test]
    fn test_failing_command_reports_stderr() {
        let executor = CommandExecutor::new();
        let err = executor
            .execute(
                &config(json!({"name": "bad", "command": "echo oops >&2; exit 3"})),
                2,
                3,
            )
            .unwrap_err();
        match err {
            BuildError::TaskFailed {
                index,
                message,
                diagnostics,
            } => {
                assert_eq!(index, 2);
                assert!(message.contains("Errors building bad"));
                assert_eq!(diagnostics.as_deref(), Some("oops\n"));
            }
            other => panic!("Expected TaskFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_env_and_cwd_fields() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new();
        let result = executor
            .execute(
                &config(json!({
                    "command": "printf '%s' \"$MODE\"; pwd",
                    "env": {"MODE": "prod"},
                    "cwd": dir.path().to_str().unwrap(),
                })),
                0,
                1,
            )
            .unwrap();
        let stdout = result["stdout"].as_str().unwrap();
        assert!(stdout.starts_with("prod"));
        assert!(stdout.trim_end().ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_missing_command_is_task_failure() {
        let executor = CommandExecutor::new();
        let err = executor.execute(&Configuration::new(), 0, 1).unwrap_err();
        assert!(matches!(err, BuildError::TaskFailed { .. }));
    }
}
