use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::Key;

/// Structural problems found while building or querying a graph.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphError {
    #[error("cycle detected: {}", join_keys(keys))]
    Cycle { keys: Vec<Key> },

    /// `task` is `None` when the missing key was requested as a target.
    #[error("missing key '{missing}'{}", referenced_by(task))]
    MissingKey { task: Option<Key>, missing: Key },

    #[error("duplicate key '{0}'")]
    DuplicateKey(Key),
}

fn join_keys(keys: &[Key]) -> String {
    keys.iter().map(Key::as_str).collect::<Vec<_>>().join(" -> ")
}

fn referenced_by(task: &Option<Key>) -> String {
    match task {
        Some(t) => format!(" referenced by '{t}'"),
        None => " requested as target".to_string(),
    }
}

/// Failure raised by a callable.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallError {
    #[error("unknown callable '{0}'")]
    UnknownCallable(String),

    #[error("bad arguments for '{callable}': {reason}")]
    BadArguments { callable: String, reason: String },

    #[error("integer overflow in '{0}'")]
    Overflow(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("{0}")]
    Failed(String),
}

/// A task's callable failed; carries the task key and the callable's message.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("task '{key}' failed: {message}")]
pub struct TaskExecutionError {
    pub key: Key,
    pub message: String,
}

impl TaskExecutionError {
    pub fn new(key: Key, message: impl Into<String>) -> Self {
        Self { key, message: message.into() }
    }
}

/// Error returned by every executor's `run`.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Task(#[from] TaskExecutionError),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("worker lost: {0}")]
    WorkerLost(String),

    #[error("task '{key}' could not be completed after {attempts} attempts")]
    SubmissionFailed { key: Key, attempts: u32 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown executor kind '{0}' (expected sync, threads, processes or distributed)")]
pub struct UnknownExecutorKind(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_keys() {
        let cycle = GraphError::Cycle { keys: vec![Key::from("a"), Key::from("b"), Key::from("a")] };
        assert_eq!(cycle.to_string(), "cycle detected: a -> b -> a");

        let missing = GraphError::MissingKey { task: Some(Key::from("x")), missing: Key::from("q") };
        assert_eq!(missing.to_string(), "missing key 'q' referenced by 'x'");

        let target = GraphError::MissingKey { task: None, missing: Key::from("zz") };
        assert_eq!(target.to_string(), "missing key 'zz' requested as target");
    }

    #[test]
    fn task_error_converts_into_exec_error() {
        let err: ExecError = TaskExecutionError::new(Key::from("k"), "boom").into();
        assert!(matches!(err, ExecError::Task(ref t) if t.key.as_str() == "k"));
        assert_eq!(err.to_string(), "task 'k' failed: boom");
    }
}
