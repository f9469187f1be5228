//! End-to-end tests: an in-process scheduler, real workers and a client over
//! loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use stellwerk_cluster::{
    Client, DistributedExecutor, SchedulerHandle, SchedulerSection, SchedulerServer, Worker, WorkerHandle,
    WorkerSection,
};
use stellwerk_core::{Arg, ExecError, Executor, Graph, GraphError, Key, Registry, Task, Value};
use stellwerk_wire::protocol::{SubmissionId, SubmissionStatus, TaskStatus, WorkerId};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_scheduler() -> SchedulerHandle {
    let config = SchedulerSection {
        bind_address: "tcp://127.0.0.1:0".into(),
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 600,
        ..SchedulerSection::default()
    };
    SchedulerServer::new(config).start().await.unwrap()
}

async fn start_worker(scheduler: &SchedulerHandle, name: &str) -> WorkerHandle {
    let section = WorkerSection {
        scheduler_address: scheduler.endpoint().to_string(),
        threads: 2,
        startup_timeout_secs: 5,
        name: Some(name.into()),
        ..WorkerSection::default()
    };
    Worker::start(&section, Arc::new(Registry::builtin())).await.unwrap()
}

async fn connect(scheduler: &SchedulerHandle) -> Client {
    Client::connect(scheduler.endpoint(), TIMEOUT).await.unwrap()
}

fn worked_example() -> Graph {
    Graph::build(vec![
        (Key::from("a"), Task::new("add", vec![Arg::lit(1), Arg::lit(2)])),
        (Key::from("b"), Task::new("mul", vec![Arg::reference("a"), Arg::lit(10)])),
        (Key::from("c"), Task::new("sub", vec![Arg::reference("b"), Arg::reference("a")])),
    ])
    .unwrap()
}

/// Poll the scheduler until `pred` holds for the task.
async fn wait_for_task(client: &Client, submission: SubmissionId, key: &str, pred: impl Fn(TaskStatus) -> bool) -> Option<WorkerId> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let snapshot = client.diagnostics().await.unwrap();
        if let Some(task) = snapshot.task(submission, key) {
            if pred(task.status) {
                return task.worker;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting on task '{key}'");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worked_example_over_the_cluster() {
    let scheduler = start_scheduler().await;
    let _w1 = start_worker(&scheduler, "w1").await;
    let _w2 = start_worker(&scheduler, "w2").await;
    let client = connect(&scheduler).await;

    let submission = client.submit(&worked_example(), &[Key::from("c")]).await.unwrap();
    let c = submission.future(&Key::from("c")).unwrap();
    let value = tokio::time::timeout(TIMEOUT, c.wait()).await.unwrap().unwrap();
    assert_eq!(value, Value::Int(27));
    assert!(c.is_ready());

    let results = submission.gather().await.unwrap();
    assert_eq!(results.keys().collect::<Vec<_>>(), vec![&Key::from("c")]);

    let snapshot = client.diagnostics().await.unwrap();
    assert_eq!(snapshot.workers.len(), 2);
    let info = snapshot.submissions.iter().find(|s| s.id == submission.id()).unwrap();
    assert_eq!(info.status, SubmissionStatus::Finished);

    scheduler.shutdown();
    scheduler.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependencies_cross_workers() {
    let scheduler = start_scheduler().await;
    let _w1 = start_worker(&scheduler, "w1").await;
    let _w2 = start_worker(&scheduler, "w2").await;
    let client = connect(&scheduler).await;

    // Leaves run on both workers, so the total fetches at least one input
    // from a peer.
    let mut tasks: Vec<(Key, Task)> = (0..8)
        .map(|i| (Key::new(format!("leaf-{i}")), Task::new("sleep", vec![Arg::lit(50), Arg::lit(i)])))
        .collect();
    tasks.push((Key::from("total"), Task::new("sum", (0..8).map(|i| Arg::reference(format!("leaf-{i}"))).collect())));
    let graph = Graph::build(tasks).unwrap();

    let submission = client.submit(&graph, &[Key::from("total")]).await.unwrap();
    let results = tokio::time::timeout(TIMEOUT, submission.gather()).await.unwrap().unwrap();
    assert_eq!(results[&Key::from("total")], Value::Int(28));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_worker_task_is_rescheduled() {
    let scheduler = start_scheduler().await;
    let w1 = start_worker(&scheduler, "w1").await;
    let w2 = start_worker(&scheduler, "w2").await;
    let client = connect(&scheduler).await;

    let graph = Graph::build(vec![(Key::from("slow"), Task::new("sleep", vec![Arg::lit(1_000), Arg::lit(7)]))]).unwrap();
    let submission = client.submit(&graph, &[Key::from("slow")]).await.unwrap();

    let running_on = wait_for_task(&client, submission.id(), "slow", |s| s == TaskStatus::Running).await;
    let (victim, survivor) = if running_on == Some(w1.worker_id()) { (w1, w2) } else { (w2, w1) };
    victim.abort();

    let value = tokio::time::timeout(Duration::from_secs(10), submission.future(&Key::from("slow")).unwrap().wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, Value::Int(7));

    let snapshot = client.diagnostics().await.unwrap();
    assert!(snapshot.worker(victim.worker_id()).is_none());
    assert!(snapshot.worker(survivor.worker_id()).is_some());
    assert_eq!(snapshot.task(submission.id(), "slow").unwrap().attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_dependency_is_rejected_at_submit() {
    let scheduler = start_scheduler().await;
    let client = connect(&scheduler).await;

    let graph = Graph::build(vec![(Key::from("a"), Task::new("add", vec![Arg::lit(1), Arg::lit(2)]))]).unwrap();
    let Err(err) = client.submit(&graph, &[Key::from("nope")]).await else {
        panic!("submission with an unknown target was accepted");
    };
    assert!(matches!(err, ExecError::Graph(GraphError::MissingKey { ref missing, .. }) if missing.as_str() == "nope"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attached_handle_outlives_the_submitting_handle() {
    let scheduler = start_scheduler().await;
    let _w = start_worker(&scheduler, "w1").await;
    let client = connect(&scheduler).await;

    let graph = Graph::build(vec![(Key::from("slow"), Task::new("sleep", vec![Arg::lit(800), Arg::lit(42)]))]).unwrap();
    let first = client.submit(&graph, &[Key::from("slow")]).await.unwrap();
    let second = client.attach(first.id(), &[Key::from("slow")]).await.unwrap();
    let slow = second.future(&Key::from("slow")).unwrap();
    // Both handles and the future count against the one interest.
    assert_eq!(slow.handle_count(), 3);

    let sid = first.id();
    drop(first);
    assert_eq!(slow.handle_count(), 2);

    let value = tokio::time::timeout(TIMEOUT, slow.wait()).await.unwrap().unwrap();
    assert_eq!(value, Value::Int(42));
    let snapshot = client.diagnostics().await.unwrap();
    let info = snapshot.submissions.iter().find(|s| s.id == sid).unwrap();
    assert_eq!(info.status, SubmissionStatus::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_every_handle_abandons_the_submission() {
    let scheduler = start_scheduler().await;
    let _w = start_worker(&scheduler, "w1").await;
    let client = connect(&scheduler).await;

    let graph = Graph::build(vec![(Key::from("slow"), Task::new("sleep", vec![Arg::lit(2_000), Arg::lit(1)]))]).unwrap();
    let first = client.submit(&graph, &[Key::from("slow")]).await.unwrap();
    let sid = first.id();
    let second = client.attach(sid, &[Key::from("slow")]).await.unwrap();
    wait_for_task(&client, sid, "slow", |s| s == TaskStatus::Running).await;
    drop(first);
    drop(second);

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let snapshot = client.diagnostics().await.unwrap();
        match snapshot.submissions.iter().find(|s| s.id == sid) {
            None => break,
            Some(info) if info.status == SubmissionStatus::Cancelled => break,
            Some(_) => {}
        }
        assert!(tokio::time::Instant::now() < deadline, "submission still running without handles");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_failure_stays_inside_its_submission() {
    let scheduler = start_scheduler().await;
    let _w = start_worker(&scheduler, "w1").await;
    let client = connect(&scheduler).await;

    let broken = Graph::build(vec![
        (Key::from("boom"), Task::new("fail", vec![Arg::lit("broken on purpose")])),
        (Key::from("after"), Task::new("identity", vec![Arg::reference("boom")])),
    ])
    .unwrap();
    let bad = client.submit(&broken, &[Key::from("after")]).await.unwrap();
    let good = client.submit(&worked_example(), &[Key::from("c")]).await.unwrap();

    let err = tokio::time::timeout(TIMEOUT, bad.gather()).await.unwrap().unwrap_err();
    match err {
        ExecError::Task(e) => {
            assert_eq!(e.key.as_str(), "boom");
            assert!(e.message.contains("broken on purpose"), "{}", e.message);
        }
        other => panic!("expected task error, got {other:?}"),
    }

    let results = tokio::time::timeout(TIMEOUT, good.gather()).await.unwrap().unwrap();
    assert_eq!(results[&Key::from("c")], Value::Int(27));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_submission_resolves_to_cancelled() {
    let scheduler = start_scheduler().await;
    let _w = start_worker(&scheduler, "w1").await;
    let client = connect(&scheduler).await;

    let graph = Graph::build(vec![(Key::from("slow"), Task::new("sleep", vec![Arg::lit(2_000), Arg::lit(1)]))]).unwrap();
    let submission = client.submit(&graph, &[Key::from("slow")]).await.unwrap();
    wait_for_task(&client, submission.id(), "slow", |s| s == TaskStatus::Running).await;

    submission.cancel().await.unwrap();
    let err = tokio::time::timeout(TIMEOUT, submission.gather()).await.unwrap().unwrap_err();
    assert!(matches!(err, ExecError::Cancelled), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handle_and_client_report_the_same_workers() {
    let scheduler = start_scheduler().await;
    let w = start_worker(&scheduler, "solo").await;
    let client = connect(&scheduler).await;

    let remote = client.diagnostics().await.unwrap();
    let info = remote.worker(w.worker_id()).unwrap();
    assert_eq!(info.name, "solo");
    assert_eq!(info.capacity, 2);
    assert_eq!(info.address, w.data_address());

    // The handle's snapshot is refreshed on the next tick.
    let mut rx = scheduler.subscribe();
    tokio::time::timeout(TIMEOUT, rx.wait_for(|s| s.worker(w.worker_id()).is_some())).await.unwrap().unwrap();
    assert_eq!(scheduler.diagnostics().workers.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_unregisters_the_worker() {
    let scheduler = start_scheduler().await;
    let w = start_worker(&scheduler, "w1").await;
    let id = w.worker_id();
    let client = connect(&scheduler).await;

    w.shutdown();
    w.join().await.unwrap();

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while client.diagnostics().await.unwrap().worker(id).is_some() {
        assert!(tokio::time::Instant::now() < deadline, "worker still registered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distributed_executor_runs_from_blocking_code() {
    let scheduler = start_scheduler().await;
    let _w = start_worker(&scheduler, "w1").await;
    let address = scheduler.endpoint().to_string();

    // The executor owns a runtime, so it lives on a plain thread.
    let results = tokio::task::spawn_blocking(move || {
        std::thread::spawn(move || {
            let executor = DistributedExecutor::connect(&address, TIMEOUT).unwrap();
            assert_eq!(executor.name(), "distributed");
            executor.run(&worked_example(), &[Key::from("c"), Key::from("a")])
        })
        .join()
        .unwrap()
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(results.keys().map(Key::as_str).collect::<Vec<_>>(), vec!["c", "a"]);
    assert_eq!(results[&Key::from("a")], Value::Int(3));
    assert_eq!(results[&Key::from("c")], Value::Int(27));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_fails_fast_without_a_scheduler() {
    let section = WorkerSection {
        scheduler_address: "tcp://127.0.0.1:1".into(),
        startup_timeout_secs: 1,
        ..WorkerSection::default()
    };
    let err = Worker::start(&section, Arc::new(Registry::builtin())).await.err().unwrap();
    assert!(matches!(err, stellwerk_cluster::ClusterError::SchedulerUnreachable { .. }), "{err}");
}
