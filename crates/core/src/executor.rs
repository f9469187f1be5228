use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ExecError, UnknownExecutorKind};
use crate::graph::Graph;
use crate::task::Key;
use crate::value::Value;

/// Target key → computed value, in target order.
pub type Results = IndexMap<Key, Value>;

/// A strategy for running a graph.
///
/// Every implementation produces the same results for the same graph and
/// targets; they differ only in where the tasks run.
pub trait Executor: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Compute `targets` and everything they depend on.
    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError>;
}

impl<T: Executor + ?Sized> Executor for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        (**self).run(graph, targets)
    }
}

impl<T: Executor + ?Sized> Executor for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        (**self).run(graph, targets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Sync,
    Threads,
    Processes,
    Distributed,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Sync => "sync",
            ExecutorKind::Threads => "threads",
            ExecutorKind::Processes => "processes",
            ExecutorKind::Distributed => "distributed",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = UnknownExecutorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" | "single-threaded" => Ok(ExecutorKind::Sync),
            "threads" | "threaded" | "threading" => Ok(ExecutorKind::Threads),
            "processes" | "process" | "multiprocessing" => Ok(ExecutorKind::Processes),
            "distributed" | "cluster" => Ok(ExecutorKind::Distributed),
            _ => Err(UnknownExecutorKind(s.to_string())),
        }
    }
}

/// Explicitly owned executor selection.
///
/// Callers build one context and pass it around; there is no process-wide
/// default executor.
pub struct ExecutionContext {
    executor: Box<dyn Executor>,
}

impl ExecutionContext {
    pub fn new(executor: impl Executor + 'static) -> Self {
        Self { executor: Box::new(executor) }
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn name(&self) -> &'static str {
        self.executor.name()
    }

    /// Swap the executor, returning the previous one.
    pub fn replace(&mut self, executor: impl Executor + 'static) -> Box<dyn Executor> {
        std::mem::replace(&mut self.executor, Box::new(executor))
    }

    pub fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        tracing::debug!(executor = self.name(), targets = targets.len(), "running graph");
        self.executor.run(graph, targets)
    }

    /// Run a single target and return its value.
    pub fn get(&self, graph: &Graph, target: &Key) -> Result<Value, ExecError> {
        let mut results = self.run(graph, std::slice::from_ref(target))?;
        results
            .shift_remove(target)
            .ok_or_else(|| ExecError::Transport(format!("executor returned no value for '{target}'")))
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").field("executor", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant;

    impl Executor for Constant {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn run(&self, _graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
            Ok(targets.iter().map(|k| (k.clone(), Value::Int(7))).collect())
        }
    }

    struct Named(&'static str);

    impl Executor for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn run(&self, _graph: &Graph, _targets: &[Key]) -> Result<Results, ExecError> {
            Err(ExecError::Cancelled)
        }
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("sync".parse::<ExecutorKind>().unwrap(), ExecutorKind::Sync);
        assert_eq!("Threaded".parse::<ExecutorKind>().unwrap(), ExecutorKind::Threads);
        assert_eq!("multiprocessing".parse::<ExecutorKind>().unwrap(), ExecutorKind::Processes);
        assert_eq!(" distributed ".parse::<ExecutorKind>().unwrap(), ExecutorKind::Distributed);
        assert_eq!("gpu".parse::<ExecutorKind>().unwrap_err(), UnknownExecutorKind("gpu".into()));
        assert_eq!(ExecutorKind::Processes.to_string(), "processes");
    }

    #[test]
    fn context_delegates_and_can_be_swapped() {
        let graph = Graph::build(Vec::new()).unwrap();
        let mut ctx = ExecutionContext::new(Constant);
        assert_eq!(ctx.name(), "constant");
        assert_eq!(ctx.get(&graph, &Key::from("k")).unwrap(), Value::Int(7));

        let previous = ctx.replace(Named("other"));
        assert_eq!(previous.name(), "constant");
        assert!(matches!(ctx.run(&graph, &[]), Err(ExecError::Cancelled)));
    }

    #[test]
    fn shared_executors_are_executors() {
        let shared: Arc<dyn Executor> = Arc::new(Constant);
        let ctx = ExecutionContext::new(shared.clone());
        assert_eq!(ctx.name(), "constant");
    }
}
