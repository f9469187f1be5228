//! Coordinator shared by the thread-pool and process-pool executors.
//!
//! The coordinator runs on the caller's thread and is the only writer of the
//! results table. Tasks run on a rayon pool and report back over an mpsc
//! channel; the coordinator blocks on that channel, so it never polls.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use stellwerk_core::{ExecError, Graph, GraphError, Key, Plan, Results, Task, TaskExecutionError, Value};
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::metrics::ExecutorMetrics;

/// How one task gets executed once its arguments are resolved.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn execute(&self, key: &Key, task: &Task, args: Vec<Value>) -> Result<Value, ExecError>;
}

pub(crate) enum Event {
    Done { key: Key, outcome: Result<Value, ExecError> },
    Cancelled,
}

pub(crate) struct Driver<'a> {
    pub pool: &'a rayon::ThreadPool,
    pub slots: usize,
    pub dispatch: Arc<dyn Dispatch>,
    pub metrics: Arc<RwLock<ExecutorMetrics>>,
    pub cancel: Option<&'a CancelFlag>,
}

impl Driver<'_> {
    pub fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        let mut plan = Plan::new(graph, targets)?;
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).record_run();

        let (tx, rx) = mpsc::channel::<Event>();
        let _subscription = self.cancel.map(|c| c.subscribe(tx.clone()));

        let mut values: HashMap<Key, Value> = HashMap::new();
        let mut in_flight = 0usize;
        let mut failure: Option<ExecError> = None;

        loop {
            if failure.is_none() && self.cancel.is_some_and(CancelFlag::is_cancelled) {
                failure = Some(ExecError::Cancelled);
            }

            while failure.is_none() && in_flight < self.slots {
                let Some(key) = plan.next_ready() else { break };
                match self.prepare(graph, &key, &values) {
                    Ok((task, args)) => {
                        self.spawn(key, task, args, tx.clone());
                        in_flight += 1;
                    }
                    Err(e) => failure = Some(e),
                }
            }

            if in_flight == 0 {
                break;
            }

            let Ok(event) = rx.recv() else { break };
            match event {
                Event::Done { key, outcome } => {
                    in_flight -= 1;
                    match outcome {
                        Ok(value) if failure.is_none() => {
                            values.insert(key.clone(), value);
                            for released in plan.complete(&key) {
                                values.remove(&released);
                            }
                        }
                        Ok(_) => debug!(key = %key, "discarding result after failure"),
                        Err(e) => {
                            if failure.is_none() {
                                warn!(key = %key, error = %e, "task failed, draining in-flight tasks");
                                failure = Some(e);
                            }
                        }
                    }
                }
                Event::Cancelled => {
                    if failure.is_none() {
                        debug!(in_flight, "run cancelled");
                        failure = Some(ExecError::Cancelled);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        plan.targets()
            .iter()
            .map(|k| {
                values
                    .remove(k)
                    .map(|v| (k.clone(), v))
                    .ok_or_else(|| ExecError::Graph(GraphError::MissingKey { task: None, missing: k.clone() }))
            })
            .collect()
    }

    fn prepare(&self, graph: &Graph, key: &Key, values: &HashMap<Key, Value>) -> Result<(Task, Vec<Value>), ExecError> {
        let task = graph
            .get(key.as_str())
            .ok_or_else(|| GraphError::MissingKey { task: None, missing: key.clone() })?;
        let args = task
            .resolve_args(|k| values.get(k))
            .map_err(|missing| GraphError::MissingKey { task: Some(key.clone()), missing })?;
        Ok((task.clone(), args))
    }

    fn spawn(&self, key: Key, task: Task, args: Vec<Value>, tx: mpsc::Sender<Event>) {
        let dispatch = Arc::clone(&self.dispatch);
        let metrics = Arc::clone(&self.metrics);
        self.pool.spawn(move || {
            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch.execute(&key, &task, args)))
                .unwrap_or_else(|payload| {
                    Err(TaskExecutionError::new(key.clone(), format!("panicked: {}", panic_message(&payload))).into())
                });

            if let Ok(mut m) = metrics.write() {
                match &outcome {
                    Ok(_) => m.record_execution(&task.callable, start.elapsed()),
                    Err(_) => m.record_failure(),
                }
            }
            let _ = tx.send(Event::Done { key, outcome });
        });
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
