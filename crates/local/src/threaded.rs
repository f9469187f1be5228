use std::sync::{Arc, PoisonError, RwLock};

use stellwerk_core::{ExecError, Executor, Graph, Key, Registry, Results, Task, Value};
use tracing::info;

use crate::cancel::CancelFlag;
use crate::driver::{Dispatch, Driver};
use crate::metrics::ExecutorMetrics;
use crate::types::resolve_pool_size;

/// Runs tasks on a fixed-size rayon pool.
///
/// At most `pool_size` tasks are in flight at once. The calling thread acts
/// as coordinator for the duration of [`Executor::run`].
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
    pool_size: usize,
    registry: Arc<Registry>,
    metrics: Arc<RwLock<ExecutorMetrics>>,
    cancel: Option<CancelFlag>,
}

struct InProcess {
    registry: Arc<Registry>,
}

impl Dispatch for InProcess {
    fn execute(&self, key: &Key, task: &Task, args: Vec<Value>) -> Result<Value, ExecError> {
        Ok(self.registry.run_task(key, task, &args)?)
    }
}

impl ThreadPoolExecutor {
    /// Build a pool with `pool_size` threads (0 = available parallelism).
    pub fn new(registry: Arc<Registry>, pool_size: usize) -> Result<Self, ExecError> {
        let pool_size = resolve_pool_size(pool_size);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("stellwerk-task-{i}"))
            .build()
            .map_err(|e| ExecError::Io(std::io::Error::other(e)))?;
        info!(pool_size, "thread pool executor ready");
        Ok(Self {
            pool,
            pool_size,
            registry,
            metrics: Arc::new(RwLock::new(ExecutorMetrics::default())),
            cancel: None,
        })
    }

    /// Attach a flag that cancels runs of this executor.
    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Snapshot of the executor's counters.
    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor").field("pool_size", &self.pool_size).finish()
    }
}

impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        Driver {
            pool: &self.pool,
            slots: self.pool_size,
            dispatch: Arc::new(InProcess { registry: Arc::clone(&self.registry) }),
            metrics: Arc::clone(&self.metrics),
            cancel: self.cancel.as_ref(),
        }
        .run(graph, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use stellwerk_core::{Arg, CallError, GraphError, TaskExecutionError};

    fn sample() -> Graph {
        Graph::build(vec![
            (Key::from("a"), Task::new("add", vec![Arg::lit(1), Arg::lit(2)])),
            (Key::from("b"), Task::new("mul", vec![Arg::reference("a"), Arg::lit(10)])),
            (Key::from("c"), Task::new("sub", vec![Arg::reference("b"), Arg::reference("a")])),
        ])
        .unwrap()
    }

    /// Registry whose `track` callable records peak concurrency.
    fn tracking_registry(current: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Registry {
        Registry::builtin().with("track", move |args: &[Value]| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(args.first().cloned().unwrap_or(Value::Null))
        })
    }

    #[test]
    fn computes_the_worked_example() {
        let executor = ThreadPoolExecutor::new(Arc::new(Registry::builtin()), 4).unwrap();
        let results = executor.run(&sample(), &[Key::from("c")]).unwrap();
        assert_eq!(results[&Key::from("c")], Value::Int(27));
        assert_eq!(executor.metrics().total_executed(), 3);
    }

    #[test]
    fn in_flight_tasks_never_exceed_pool_size() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = tracking_registry(Arc::clone(&current), Arc::clone(&peak));

        let mut tasks: Vec<(Key, Task)> = (0..12)
            .map(|i| (Key::new(format!("leaf{i}")), Task::new("track", vec![Arg::lit(i)])))
            .collect();
        let refs = (0..12).map(|i| Arg::reference(format!("leaf{i}"))).collect();
        tasks.push((Key::from("total"), Task::new("sum", refs)));
        let graph = Graph::build(tasks).unwrap();

        let executor = ThreadPoolExecutor::new(Arc::new(registry), 3).unwrap();
        let results = executor.run(&graph, &[Key::from("total")]).unwrap();
        assert_eq!(results[&Key::from("total")], Value::Int(66));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2, "independent tasks should overlap");
    }

    #[test]
    fn failure_is_returned_and_dependents_never_start() {
        let started = Arc::new(Mutex::new(Vec::<i64>::new()));
        let log = Arc::clone(&started);
        let registry = Registry::builtin().with("record", move |args: &[Value]| {
            if let Some(Value::Int(i)) = args.first() {
                log.lock().unwrap().push(*i);
            }
            Ok(Value::Null)
        });
        let graph = Graph::build(vec![
            (Key::from("bad"), Task::new("fail", vec![Arg::lit("nope")])),
            (Key::from("child"), Task::new("record", vec![Arg::lit(1), Arg::reference("bad")])),
        ])
        .unwrap();

        let executor = ThreadPoolExecutor::new(Arc::new(registry), 2).unwrap();
        let err = executor.run(&graph, &[Key::from("child")]).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Task(TaskExecutionError { ref key, .. }) if key == &Key::from("bad")
        ));
        assert!(started.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_callable_becomes_task_error() {
        let registry = Registry::builtin().with("explode", |_: &[Value]| -> Result<Value, CallError> {
            panic!("kaboom")
        });
        let graph = Graph::build(vec![(Key::from("x"), Task::new("explode", vec![]))]).unwrap();
        let executor = ThreadPoolExecutor::new(Arc::new(registry), 1).unwrap();
        match executor.run(&graph, &[Key::from("x")]).unwrap_err() {
            ExecError::Task(e) => assert!(e.message.contains("kaboom")),
            other => panic!("unexpected error: {other:?}"),
        }
        // The pool survives and keeps working.
        let ok = Graph::build(vec![(Key::from("y"), Task::new("identity", vec![Arg::lit(1)]))]).unwrap();
        assert!(executor.run(&ok, &[Key::from("y")]).is_ok());
    }

    #[test]
    fn cancel_from_another_thread() {
        let flag = CancelFlag::new();
        let graph = Graph::build(
            (0..8).map(|i| (Key::new(format!("slow{i}")), Task::new("sleep", vec![Arg::lit(200), Arg::lit(i)]))),
        )
        .unwrap();
        let targets: Vec<Key> = graph.tasks().keys().cloned().collect();

        let executor = ThreadPoolExecutor::new(Arc::new(Registry::builtin()), 2)
            .unwrap()
            .with_cancel(flag.clone());
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.cancel();
        });

        let start = Instant::now();
        let err = executor.run(&graph, &targets).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, ExecError::Cancelled));
        // Only the first wave of two tasks had to drain.
        assert!(start.elapsed() < Duration::from_millis(700));
    }

    #[test]
    fn missing_target_fails_before_running() {
        let executor = ThreadPoolExecutor::new(Arc::new(Registry::builtin()), 2).unwrap();
        let err = executor.run(&sample(), &[Key::from("nope")]).unwrap_err();
        assert!(matches!(err, ExecError::Graph(GraphError::MissingKey { .. })));
        assert_eq!(executor.metrics().runs, 0);
    }
}
