//! Every local executor must agree with the synchronous reference.

use std::sync::Arc;

use stellwerk_core::{Arg, ExecError, Executor, Graph, GraphError, Key, Registry, Task, Value};
use stellwerk_local::{ProcessConfig, ProcessPoolExecutor, SyncExecutor, ThreadPoolExecutor};

fn executors() -> Vec<Box<dyn Executor>> {
    let registry = Arc::new(Registry::builtin());
    vec![
        Box::new(SyncExecutor::new(Arc::clone(&registry))),
        Box::new(ThreadPoolExecutor::new(Arc::clone(&registry), 1).unwrap()),
        Box::new(ThreadPoolExecutor::new(Arc::clone(&registry), 4).unwrap()),
        Box::new(
            ProcessPoolExecutor::new(ProcessConfig::new(env!("CARGO_BIN_EXE_stellwerk-proc-worker")).workers(3))
                .unwrap(),
        ),
    ]
}

/// Wide fan-in: `width` leaves, pairwise partial sums, one total.
fn fan_in(width: i64) -> Graph {
    let mut tasks = Vec::new();
    for i in 0..width {
        tasks.push((Key::new(format!("leaf-{i}")), Task::new("mul", vec![Arg::lit(i), Arg::lit(i)])));
    }
    for i in (0..width).step_by(2) {
        tasks.push((
            Key::new(format!("pair-{i}")),
            Task::new(
                "add",
                vec![Arg::reference(format!("leaf-{i}")), Arg::reference(format!("leaf-{}", i + 1))],
            ),
        ));
    }
    let pairs = (0..width).step_by(2).map(|i| Arg::reference(format!("pair-{i}"))).collect();
    tasks.push((Key::from("total"), Task::new("sum", pairs)));
    tasks.push((Key::from("count"), Task::new("len", vec![Arg::reference("pairs")])));
    tasks.push((
        Key::from("pairs"),
        Task::new("list", (0..width).step_by(2).map(|i| Arg::reference(format!("pair-{i}"))).collect()),
    ));
    Graph::build(tasks).unwrap()
}

#[test]
fn worked_example_under_every_executor() {
    let graph = Graph::build(vec![
        (Key::from("a"), Task::new("add", vec![Arg::lit(1), Arg::lit(2)])),
        (Key::from("b"), Task::new("mul", vec![Arg::reference("a"), Arg::lit(10)])),
        (Key::from("c"), Task::new("sub", vec![Arg::reference("b"), Arg::reference("a")])),
    ])
    .unwrap();
    for executor in executors() {
        let results = executor.run(&graph, &[Key::from("c")]).unwrap();
        assert_eq!(results[&Key::from("c")], Value::Int(27), "executor {}", executor.name());
    }
}

#[test]
fn fan_in_results_match_the_reference() {
    let graph = fan_in(40);
    let targets = [Key::from("total"), Key::from("count"), Key::from("leaf-7")];
    let reference = SyncExecutor::default().run(&graph, &targets).unwrap();
    assert_eq!(reference[&Key::from("total")], Value::Int((0..40).map(|i| i * i).sum::<i64>()));
    assert_eq!(reference[&Key::from("count")], Value::Int(20));

    for executor in executors() {
        let results = executor.run(&graph, &targets).unwrap();
        assert_eq!(results, reference, "executor {}", executor.name());
        let keys: Vec<_> = results.keys().cloned().collect();
        assert_eq!(keys, targets.to_vec(), "executor {}", executor.name());
    }
}

#[test]
fn missing_key_is_reported_before_execution_everywhere() {
    let graph = fan_in(4);
    for executor in executors() {
        let err = executor.run(&graph, &[Key::from("absent")]).unwrap_err();
        assert!(
            matches!(err, ExecError::Graph(GraphError::MissingKey { .. })),
            "executor {} returned {err:?}",
            executor.name()
        );
    }
}

#[test]
fn untargeted_failing_task_never_runs() {
    let graph = Graph::build(vec![
        (Key::from("fine"), Task::new("add", vec![Arg::lit(20), Arg::lit(22)])),
        (Key::from("broken"), Task::new("fail", vec![Arg::reference("fine")])),
    ])
    .unwrap();
    for executor in executors() {
        let results = executor.run(&graph, &[Key::from("fine")]).unwrap();
        assert_eq!(results[&Key::from("fine")], Value::Int(42), "executor {}", executor.name());
    }
}

#[test]
fn failure_surfaces_as_task_error_everywhere() {
    let graph = Graph::build(vec![
        (Key::from("ok"), Task::new("identity", vec![Arg::lit(1)])),
        (Key::from("bad"), Task::new("fail", vec![Arg::reference("ok")])),
        (Key::from("top"), Task::new("add", vec![Arg::reference("bad"), Arg::lit(1)])),
    ])
    .unwrap();
    for executor in executors() {
        match executor.run(&graph, &[Key::from("top")]) {
            Err(ExecError::Task(e)) => assert_eq!(e.key, Key::from("bad"), "executor {}", executor.name()),
            other => panic!("executor {} returned {other:?}", executor.name()),
        }
    }
}
