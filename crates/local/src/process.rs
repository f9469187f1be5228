use std::io::BufReader;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use stellwerk_core::{ExecError, Executor, Graph, Key, Results, Task, TaskExecutionError, Value};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::driver::{Dispatch, Driver};
use crate::frame::{read_frame, write_frame, FrameError, ProcRequest, ProcResponse};
use crate::metrics::ExecutorMetrics;
use crate::types::ProcessConfig;

// ── Child processes ──────────────────────────────────────────

struct ChildWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ChildWorker {
    fn spawn(config: &ProcessConfig) -> std::io::Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| std::io::Error::other("child stdin not piped"))?;
        let stdout = child.stdout.take().ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        debug!(pid = child.id(), program = %config.program.display(), "spawned worker process");
        Ok(Self { child, stdin, stdout: BufReader::new(stdout) })
    }

    fn call(&mut self, req: &ProcRequest) -> Result<ProcResponse, FrameError> {
        write_frame(&mut self.stdin, req)?;
        read_frame(&mut self.stdout)?.ok_or_else(|| {
            FrameError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "worker process exited"))
        })
    }

    /// Close stdin so the child exits on end of input, then reap it.
    fn close(self) {
        let Self { mut child, stdin, stdout } = self;
        drop(stdin);
        drop(stdout);
        if let Err(e) = child.wait() {
            warn!(error = %e, "failed to reap worker process");
        }
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Idle children waiting for work.
struct ChildPool {
    config: ProcessConfig,
    idle: Mutex<Vec<ChildWorker>>,
    spawned: AtomicU64,
}

impl ChildPool {
    fn checkout(&self) -> std::io::Result<ChildWorker> {
        if let Some(w) = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop() {
            return Ok(w);
        }
        let w = ChildWorker::spawn(&self.config)?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(w)
    }

    fn checkin(&self, w: ChildWorker) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(w);
    }

    fn drain(&self) {
        let children: Vec<ChildWorker> =
            std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        for w in children {
            w.close();
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct OutOfProcess {
    children: Arc<ChildPool>,
    max_retries: u32,
    metrics: Arc<RwLock<ExecutorMetrics>>,
}

impl Dispatch for OutOfProcess {
    fn execute(&self, key: &Key, task: &Task, args: Vec<Value>) -> Result<Value, ExecError> {
        let req = ProcRequest { callable: task.callable.clone(), args };
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut worker = self.children.checkout().map_err(|e| {
                ExecError::WorkerUnavailable(format!(
                    "cannot start {}: {e}",
                    self.children.config.program.display()
                ))
            })?;

            match worker.call(&req) {
                Ok(ProcResponse::Ok(value)) => {
                    self.children.checkin(worker);
                    return Ok(value);
                }
                Ok(ProcResponse::Err(e)) => {
                    self.children.checkin(worker);
                    return Err(TaskExecutionError::new(key.clone(), e.to_string()).into());
                }
                Err(e) => {
                    warn!(key = %key, attempt = attempts, error = %e, "worker process lost mid-task");
                    worker.kill();
                    if attempts > self.max_retries {
                        return Err(ExecError::SubmissionFailed { key: key.clone(), attempts });
                    }
                    if let Ok(mut m) = self.metrics.write() {
                        m.record_retry();
                    }
                }
            }
        }
    }
}

// ── Executor ─────────────────────────────────────────────────

/// Runs each task in a child process speaking the stdio frame protocol.
///
/// Children are stateless between tasks. A child that dies mid-task is
/// replaced and the task retried up to `max_retries` times.
pub struct ProcessPoolExecutor {
    pool: rayon::ThreadPool,
    workers: usize,
    keep_warm: bool,
    children: Arc<ChildPool>,
    dispatch: Arc<OutOfProcess>,
    metrics: Arc<RwLock<ExecutorMetrics>>,
    cancel: Option<CancelFlag>,
}

impl ProcessPoolExecutor {
    pub fn new(config: ProcessConfig) -> Result<Self, ExecError> {
        let workers = config.resolved_workers();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stellwerk-proc-{i}"))
            .build()
            .map_err(|e| ExecError::Io(std::io::Error::other(e)))?;
        info!(workers, program = %config.program.display(), "process pool executor ready");

        let metrics = Arc::new(RwLock::new(ExecutorMetrics::default()));
        let keep_warm = config.keep_warm;
        let max_retries = config.max_retries;
        let children = Arc::new(ChildPool { config, idle: Mutex::new(Vec::new()), spawned: AtomicU64::new(0) });
        let dispatch = Arc::new(OutOfProcess {
            children: Arc::clone(&children),
            max_retries,
            metrics: Arc::clone(&metrics),
        });
        Ok(Self { pool, workers, keep_warm, children, dispatch, metrics, cancel: None })
    }

    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Children started over the executor's lifetime, replacements included.
    pub fn children_spawned(&self) -> u64 {
        self.children.spawned.load(Ordering::Relaxed)
    }

    pub fn idle_children(&self) -> usize {
        self.children.idle_count()
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop every idle child.
    pub fn shutdown(&self) {
        self.children.drain();
    }
}

impl std::fmt::Debug for ProcessPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPoolExecutor")
            .field("workers", &self.workers)
            .field("keep_warm", &self.keep_warm)
            .finish()
    }
}

impl Executor for ProcessPoolExecutor {
    fn name(&self) -> &'static str {
        "processes"
    }

    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        let dispatch: Arc<dyn Dispatch> = self.dispatch.clone();
        let result = Driver {
            pool: &self.pool,
            slots: self.workers,
            dispatch,
            metrics: Arc::clone(&self.metrics),
            cancel: self.cancel.as_ref(),
        }
        .run(graph, targets);

        if !self.keep_warm {
            self.children.drain();
        }
        result
    }
}

impl Drop for ProcessPoolExecutor {
    fn drop(&mut self) {
        self.children.drain();
    }
}
