use std::collections::HashMap;
use std::sync::Arc;

use stellwerk_core::{ExecError, Executor, Graph, GraphError, Key, Plan, Registry, Results, Value};
use tracing::debug;

/// Runs every task on the calling thread, in topological order.
///
/// This is the reference behaviour the pooled executors are measured
/// against: the first failing task aborts the run and no partial results
/// are returned.
#[derive(Debug, Clone)]
pub struct SyncExecutor {
    registry: Arc<Registry>,
}

impl SyncExecutor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Default for SyncExecutor {
    fn default() -> Self {
        Self::new(Arc::new(Registry::builtin()))
    }
}

impl Executor for SyncExecutor {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        let mut plan = Plan::new(graph, targets)?;
        let mut values: HashMap<Key, Value> = HashMap::new();

        while let Some(key) = plan.next_ready() {
            let task = graph
                .get(key.as_str())
                .ok_or_else(|| GraphError::MissingKey { task: None, missing: key.clone() })?;
            let args = task
                .resolve_args(|k| values.get(k))
                .map_err(|missing| GraphError::MissingKey { task: Some(key.clone()), missing })?;

            debug!(key = %key, callable = %task.callable, "running task");
            let value = self.registry.run_task(&key, task, &args)?;
            values.insert(key.clone(), value);
            for released in plan.complete(&key) {
                values.remove(&released);
            }
        }

        let mut results = Results::with_capacity(plan.targets().len());
        for target in plan.targets() {
            let value = values
                .remove(target)
                .ok_or_else(|| GraphError::MissingKey { task: None, missing: target.clone() })?;
            results.insert(target.clone(), value);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stellwerk_core::{Arg, CallError, Task, TaskExecutionError};

    fn sample() -> Graph {
        Graph::build(vec![
            (Key::from("a"), Task::new("add", vec![Arg::lit(1), Arg::lit(2)])),
            (Key::from("b"), Task::new("mul", vec![Arg::reference("a"), Arg::lit(10)])),
            (Key::from("c"), Task::new("sub", vec![Arg::reference("b"), Arg::reference("a")])),
        ])
        .unwrap()
    }

    #[test]
    fn computes_the_worked_example() {
        let results = SyncExecutor::default().run(&sample(), &[Key::from("c")]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[&Key::from("c")], Value::Int(27));
    }

    #[test]
    fn returns_every_requested_target_in_order() {
        let results = SyncExecutor::default()
            .run(&sample(), &[Key::from("c"), Key::from("a")])
            .unwrap();
        let keys: Vec<_> = results.keys().cloned().collect();
        assert_eq!(keys, vec![Key::from("c"), Key::from("a")]);
        assert_eq!(results[&Key::from("a")], Value::Int(3));
    }

    #[test]
    fn first_failure_aborts_without_partial_results() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = Registry::builtin().with("count", move |args: &[Value]| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(args.first().cloned().unwrap_or(Value::Null))
        });
        let graph = Graph::build(vec![
            (Key::from("boom"), Task::new("fail", vec![Arg::lit("kaput")])),
            (Key::from("after"), Task::new("count", vec![Arg::reference("boom")])),
        ])
        .unwrap();

        let err = SyncExecutor::new(Arc::new(registry))
            .run(&graph, &[Key::from("after")])
            .unwrap_err();
        match err {
            ExecError::Task(TaskExecutionError { key, message }) => {
                assert_eq!(key, Key::from("boom"));
                assert_eq!(message, CallError::Failed("kaput".into()).to_string());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn untargeted_tasks_never_run() {
        let graph = Graph::build(vec![
            (Key::from("ok"), Task::new("identity", vec![Arg::lit(5)])),
            (Key::from("dead"), Task::new("fail", vec![])),
        ])
        .unwrap();
        let results = SyncExecutor::default().run(&graph, &[Key::from("ok")]).unwrap();
        assert_eq!(results[&Key::from("ok")], Value::Int(5));
    }

    #[test]
    fn unknown_target_is_reported_before_execution() {
        let err = SyncExecutor::default().run(&sample(), &[Key::from("zz")]).unwrap_err();
        assert!(matches!(err, ExecError::Graph(GraphError::MissingKey { .. })));
    }
}
