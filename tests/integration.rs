//! Integration tests for the parabuild CLI.
//!
//! These run the real binary, which spawns itself as worker processes, over
//! configuration files in temporary directories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::tempdir;

use parabuild::config::LoadContext;
use parabuild::task::Task;
use parabuild::{BuildError, WorkerCommand, WorkerPool, WorkerPoolConfig};

/// Get a command for the parabuild binary.
fn parabuild() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("parabuild").unwrap();
    cmd.arg("--no-color");
    cmd
}

fn write_config(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help_displays() {
    parabuild()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-retries"))
        .stdout(predicate::str::contains("--bail"))
        .stdout(predicate::str::contains("internal-worker").not());
}

#[test]
fn test_results_in_configuration_order() {
    let dir = tempdir().unwrap();
    // Earlier targets take longer, so they finish last.
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([
            {"name": "slow", "command": "sleep 0.4; echo slow"},
            {"name": "medium", "command": "sleep 0.2; echo medium"},
            {"name": "fast", "command": "echo fast"},
        ]),
    );

    let output = parabuild()
        .args(["--json", "-p", "3", "-c"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());

    let results = json_stdout(&output);
    let names: Vec<&str> = results
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["slow", "medium", "fast"]);
    assert_eq!(results[0]["stdout"], json!("slow\n"));
    assert_eq!(results[2]["index"], json!(2));
}

#[test]
fn test_single_object_config() {
    let dir = tempdir().unwrap();
    write_config(
        dir.path(),
        "build.json",
        &json!({"name": "solo", "command": "echo one"}),
    );

    let output = parabuild()
        .current_dir(dir.path())
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());
    let results = json_stdout(&output);
    assert_eq!(results.as_array().unwrap().len(), 1);
    assert_eq!(results[0]["name"], json!("solo"));
}

#[test]
fn test_extension_is_resolved() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "targets.json", &json!([{"command": "true"}]));

    parabuild()
        .current_dir(dir.path())
        .args(["--json", "-c", "targets"])
        .assert()
        .success();
}

#[test]
fn test_variant_document_with_env_args() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "build.json",
        &json!({
            "base": {"command": "echo ${env.mode}"},
            "variants": {"name": ["a", "b"], "target": ["web", "node"]}
        }),
    );

    let output = parabuild()
        .arg("--json")
        .arg("-c")
        .arg(&config)
        .args(["--", "--env.mode=production"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let results = json_stdout(&output);
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 4);
    let names: Vec<&str> = results.iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a", "a", "b", "b"]);
    assert!(results.iter().all(|r| r["stdout"] == json!("production\n")));
}

#[test]
fn test_progress_notices() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([{"name": "app", "command": "true"}, {"name": "lib", "command": "true"}]),
    );

    parabuild()
        .arg("-c")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("[BUILD] Building 2 targets"))
        .stderr(predicate::str::contains("Started building app"))
        .stderr(predicate::str::contains("Finished building lib within"))
        .stderr(predicate::str::contains("Finished build after"));
}

#[test]
fn test_single_target_notice_is_singular() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "build.json", &json!({"command": "true"}));

    parabuild()
        .arg("-c")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("[BUILD] Building 1 target\n"))
        .stderr(predicate::str::contains("1 targets").not());
}

#[test]
fn test_json_mode_is_silent() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "build.json", &json!([{"command": "true"}]));

    parabuild()
        .arg("--json")
        .arg("-c")
        .arg(&config)
        .env_remove("PARABUILD_LOG")
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .stderr(predicate::str::contains("[BUILD]").not());
}

#[test]
fn test_collect_all_waits_and_reports_first_failure() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("straggler-done");
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([
            {"name": "ok", "command": "true"},
            {"name": "broken", "command": "sleep 0.2; echo nope >&2; exit 3"},
            {"name": "also-broken", "command": "exit 4"},
            {"name": "straggler", "command": format!("sleep 0.6; touch {}", marker.display())},
        ]),
    );

    parabuild()
        .args(["-p", "4", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Errors building broken"))
        .stderr(predicate::str::contains("Build failed after"));
    assert!(marker.exists());
}

#[test]
fn test_bail_does_not_wait_for_stragglers() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([
            {"name": "broken", "command": "exit 1"},
            {"name": "slow", "command": "exec sleep 10"},
        ]),
    );

    let start = Instant::now();
    parabuild()
        .args(["--bail", "-p", "2", "--shutdown-grace-secs", "2", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Errors building broken"));
    assert!(start.elapsed() < Duration::from_secs(8));
}

#[test]
fn test_missing_config_fails_before_workers() {
    let dir = tempdir().unwrap();
    parabuild()
        .current_dir(dir.path())
        .args(["-c", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not load configuration file"))
        .stderr(predicate::str::contains("Building").not());
}

#[test]
fn test_invalid_options_rejected() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "build.json", &json!([{"command": "true"}]));
    parabuild()
        .args(["-p", "0", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("maxConcurrentWorkers"));
}

fn crash_config(dir: &Path) -> PathBuf {
    // The shell's parent is the worker process.
    write_config(
        dir,
        "build.json",
        &json!([{
            "name": "crasher",
            "cwd": dir.to_str().unwrap(),
            "command": "echo attempt >> attempts.log; kill -9 $PPID"
        }]),
    )
}

fn attempts(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("attempts.log"))
        .unwrap_or_default()
        .lines()
        .count()
}

#[test]
fn test_crashed_worker_is_retried() {
    let dir = tempdir().unwrap();
    let config = crash_config(dir.path());

    parabuild()
        .args(["-m", "2", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("after 3 attempt(s)"));
    assert_eq!(attempts(dir.path()), 3);
}

#[test]
fn test_crash_without_retries_fails_at_once() {
    let dir = tempdir().unwrap();
    let config = crash_config(dir.path());

    parabuild()
        .arg("-c")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Worker crashed"));
    assert_eq!(attempts(dir.path()), 1);
}

fn worker_pids(extra: &[&str]) -> BTreeSet<String> {
    let dir = tempdir().unwrap();
    let targets: Vec<Value> = (0..4)
        .map(|i| json!({"name": format!("t{i}"), "command": "echo $PPID"}))
        .collect();
    let config = write_config(dir.path(), "build.json", &Value::Array(targets));

    let output = parabuild()
        .args(["--json", "-p", "1"])
        .args(extra)
        .arg("-c")
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    json_stdout(&output)
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["stdout"].as_str().unwrap().trim().to_string())
        .collect()
}

#[test]
fn test_workers_are_reused() {
    assert_eq!(worker_pids(&[]).len(), 1);
}

#[test]
fn test_max_calls_per_worker_recycles() {
    assert_eq!(worker_pids(&["--max-calls-per-worker", "1"]).len(), 4);
}

#[test]
fn test_watch_timeout_when_a_target_never_finishes() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([
            {"name": "quick", "command": "true"},
            {"name": "stuck", "command": "exec sleep 30"},
        ]),
    );

    let start = Instant::now();
    parabuild()
        .args([
            "--watch",
            "-p",
            "2",
            "--watch-timeout-secs",
            "1",
            "--shutdown-grace-secs",
            "2",
            "-c",
        ])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No watch cycle completed"));
    assert!(start.elapsed() < Duration::from_secs(20));
}

#[test]
fn test_watch_stops_cleanly_on_interrupt() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([{"name": "a", "command": "true"}, {"name": "b", "command": "true"}]),
    );

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_parabuild"))
        .args(["--no-color", "--json", "--watch", "-p", "2"])
        .args(["--watch-interval-ms", "50", "-c"])
        .arg(&config)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(1500));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    while child.try_wait().unwrap().is_none() {
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("parabuild did not stop after SIGINT");
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let summary = json_stdout(&output);
    assert!(summary["cycles"].as_u64().unwrap() >= 1);
}

/// The pool against real worker processes of the built binary.
fn pool() -> WorkerPool {
    let command = WorkerCommand::new(env!("CARGO_BIN_EXE_parabuild"))
        .arg("--internal-worker")
        .env("PARABUILD_LOG", "off");
    let mut config = WorkerPoolConfig::new(command);
    config.worker_count = 2;
    WorkerPool::new(config).unwrap()
}

#[test]
fn test_pool_reports_dispatch_mismatch_from_worker() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "build.json",
        &json!([{"command": "true"}, {"command": "true"}]),
    );

    let pool = pool();
    let handle = pool.submit(Task::from_file(&config, LoadContext::default(), 0, 3).silent(true));
    match handle.wait().unwrap_err() {
        BuildError::DispatchMismatch {
            index,
            expected,
            actual,
        } => assert_eq!((index, expected, actual), (0, 3, 2)),
        other => panic!("Expected DispatchMismatch, got {other:?}"),
    }
}

#[test]
fn test_pool_runs_inline_tasks() {
    let pool = pool();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let config = json!({"name": format!("t{i}"), "command": format!("echo {i}")});
            pool.submit(Task::inline(config.as_object().cloned().unwrap(), i, 4).silent(true))
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.wait().unwrap();
        assert_eq!(result["stdout"], json!(format!("{i}\n")));
    }
    pool.shutdown();
    assert_eq!(pool.stats().tasks_completed, 4);
    assert!(pool.submit(Task::inline(Default::default(), 0, 1)).wait().unwrap_err().is_shutdown());
}
