use std::io::Write;
use std::process::{Command, Output};

const WORKED_EXAMPLE: &str = r#"{
    "a": ["add", 1, 2],
    "b": ["mul", {"ref": "a"}, 10],
    "c": ["sub", {"ref": "b"}, {"ref": "a"}],
    "never": ["fail", "must not run"]
}"#;

fn graph_file(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn stellwerk(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stellwerk"))
        .args(args)
        .env_remove("STELLWERK_EXECUTOR")
        .env_remove("STELLWERK_PROFILE")
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn run_prints_targets_for_each_local_executor() {
    let file = graph_file(WORKED_EXAMPLE);
    let path = file.path().to_str().unwrap();
    for executor in ["sync", "threads"] {
        let output = stellwerk(&["run", path, "--target", "c", "--target", "a", "--executor", executor]);
        let json = stdout_json(&output);
        assert_eq!(json, serde_json::json!({"c": 27, "a": 3}), "executor {executor}");
    }
}

#[test]
fn compact_output_keeps_target_order() {
    let file = graph_file(WORKED_EXAMPLE);
    let output = stellwerk(&["run", file.path().to_str().unwrap(), "-t", "b", "-t", "a", "-e", "sync", "--compact"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), r#"{"b":30,"a":3}"#);
}

#[test]
fn task_failure_exits_non_zero() {
    let file = graph_file(WORKED_EXAMPLE);
    let output = stellwerk(&["run", file.path().to_str().unwrap(), "-t", "never", "-e", "sync"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("must not run"), "stderr: {stderr}");
}

#[test]
fn unknown_target_is_reported() {
    let file = graph_file(WORKED_EXAMPLE);
    let output = stellwerk(&["run", file.path().to_str().unwrap(), "-t", "zzz", "-e", "threads"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("zzz"));
}

#[test]
fn cyclic_definition_is_rejected() {
    let file = graph_file(r#"{"x": ["identity", {"ref": "y"}], "y": ["identity", {"ref": "x"}]}"#);
    let output = stellwerk(&["run", file.path().to_str().unwrap(), "-e", "sync"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cycle"));
}

#[test]
fn unknown_executor_is_a_usage_error() {
    let file = graph_file(WORKED_EXAMPLE);
    let output = stellwerk(&["run", file.path().to_str().unwrap(), "-e", "gpu"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn plan_lists_only_reachable_tasks_in_order() {
    let file = graph_file(WORKED_EXAMPLE);
    let output = stellwerk(&["plan", file.path().to_str().unwrap(), "-t", "c"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let keys: Vec<&str> = stdout.lines().filter_map(|l| l.split_whitespace().next()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(stdout.contains("c  sub  <- b, a"));
}

#[test]
fn duplicate_keys_in_a_definition_are_rejected() {
    let file = graph_file(r#"{"a": ["add", 1, 2], "a": ["neg", 1]}"#);
    let output = stellwerk(&["run", file.path().to_str().unwrap(), "-e", "sync"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("duplicate key 'a'"));
}
