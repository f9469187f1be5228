//! Supervision of the single-process workers behind
//! `stellwerk-worker --process-count N`.
//!
//! Each child is watched by its own task, which reports how the child ended
//! as an [`ExitReason`]. Workers encode that reason in their exit code (see
//! [`exit_code`]), so the supervisor can tell a worker that could never
//! reach the scheduler from one that crashed or was evicted. Crashed and
//! evicted workers are restarted under their old name until their restart
//! budget runs out; a worker that ends for good stops the whole group.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::ClusterError;

/// Exit codes a worker process uses to tell its supervisor why it ended.
pub mod exit_code {
    pub const STOPPED: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const SCHEDULER_UNREACHABLE: i32 = 3;
    pub const EVICTED: i32 = 4;
}

/// Time a worker gets to say goodbye after being asked to stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Asked to stop, or stopped on its own after saying goodbye.
    Stopped,
    /// Never reached the scheduler; a new process would not either.
    SchedulerUnreachable,
    /// The scheduler wrote the worker off.
    Evicted,
    /// Any other failure. `None` when a signal ended the process.
    Crashed { code: Option<i32> },
    /// The process could not be started.
    SpawnFailed(String),
}

impl ExitReason {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(exit_code::STOPPED) => Self::Stopped,
            Some(exit_code::SCHEDULER_UNREACHABLE) => Self::SchedulerUnreachable,
            Some(exit_code::EVICTED) => Self::Evicted,
            code => Self::Crashed { code },
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self::from_code(status.code())
    }

    /// How a worker process reports `err` to its supervisor.
    pub fn from_error(err: &ClusterError) -> Self {
        match err {
            ClusterError::SchedulerUnreachable { .. } => Self::SchedulerUnreachable,
            ClusterError::Evicted(_) => Self::Evicted,
            _ => Self::Crashed { code: Some(exit_code::FAILED) },
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Stopped => exit_code::STOPPED,
            Self::SchedulerUnreachable => exit_code::SCHEDULER_UNREACHABLE,
            Self::Evicted => exit_code::EVICTED,
            Self::Crashed { code } => code.filter(|&c| c != exit_code::STOPPED).unwrap_or(exit_code::FAILED),
            Self::SpawnFailed(_) => exit_code::FAILED,
        }
    }

    /// Whether a fresh process has a chance of doing better.
    pub fn restartable(&self) -> bool {
        matches!(self, Self::Evicted | Self::Crashed { .. })
    }
}

/// How to start one supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Final state of one supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub name: String,
    pub reason: ExitReason,
    pub restarts: u32,
}

/// Exit code for the supervising process: that of the first worker that
/// did not stop cleanly, else 0.
pub fn group_exit_code(exits: &[WorkerExit]) -> i32 {
    exits
        .iter()
        .map(|e| e.reason.exit_code())
        .find(|&code| code != exit_code::STOPPED)
        .unwrap_or(exit_code::STOPPED)
}

pub struct Supervisor {
    workers: Vec<WorkerCommand>,
    max_restarts: u32,
    stop_grace: Duration,
}

struct ChildEnded {
    index: usize,
    reason: ExitReason,
}

impl Supervisor {
    pub fn new(workers: Vec<WorkerCommand>, max_restarts: u32) -> Self {
        Self { workers, max_restarts, stop_grace: DEFAULT_STOP_GRACE }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Run every worker until `shutdown` resolves or none is left.
    ///
    /// Returns one [`WorkerExit`] per worker, in the order they were given.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Vec<WorkerExit> {
        let width = self.workers.iter().map(|w| w.name.len()).max().unwrap_or(0);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        let launch = |index: usize, worker: &WorkerCommand| {
            tokio::spawn(watch_child(
                index,
                worker.clone(),
                width,
                self.stop_grace,
                stop_rx.clone(),
                ended_tx.clone(),
            ));
        };

        for (index, worker) in self.workers.iter().enumerate() {
            info!(worker = %worker.name, "starting worker process");
            launch(index, worker);
        }

        let mut restarts = vec![0u32; self.workers.len()];
        let mut reasons: Vec<Option<ExitReason>> = vec![None; self.workers.len()];
        let mut live = self.workers.len();
        let mut stopping = false;
        tokio::pin!(shutdown);

        while live > 0 {
            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    info!(live, "stopping worker processes");
                    stopping = true;
                    let _ = stop_tx.send(true);
                }
                Some(ChildEnded { index, reason }) = ended_rx.recv() => {
                    let name = &self.workers[index].name;
                    if !stopping && reason.restartable() && restarts[index] < self.max_restarts {
                        restarts[index] += 1;
                        warn!(worker = %name, ?reason, restart = restarts[index], "restarting worker process");
                        launch(index, &self.workers[index]);
                        continue;
                    }

                    live -= 1;
                    if reason == ExitReason::Stopped {
                        info!(worker = %name, "worker process stopped");
                    } else {
                        error!(worker = %name, ?reason, restarts = restarts[index], "worker process ended");
                        if !stopping {
                            stopping = true;
                            let _ = stop_tx.send(true);
                        }
                    }
                    reasons[index] = Some(reason);
                }
                else => break,
            }
        }

        self.workers
            .into_iter()
            .zip(reasons)
            .zip(restarts)
            .map(|((worker, reason), restarts)| WorkerExit {
                name: worker.name,
                reason: reason.unwrap_or(ExitReason::Stopped),
                restarts,
            })
            .collect()
    }
}

async fn watch_child(
    index: usize,
    worker: WorkerCommand,
    width: usize,
    grace: Duration,
    mut stop: watch::Receiver<bool>,
    ended: mpsc::UnboundedSender<ChildEnded>,
) {
    let reason = match spawn_child(&worker, width) {
        Err(e) => ExitReason::SpawnFailed(e.to_string()),
        Ok(mut child) => {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ExitReason::from_status(status),
                    Err(e) => ExitReason::SpawnFailed(e.to_string()),
                },
                _ = stop_requested(&mut stop) => {
                    stop_child(&mut child, &worker.name, grace).await;
                    ExitReason::Stopped
                }
            }
        }
    };
    let _ = ended.send(ChildEnded { index, reason });
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn spawn_child(worker: &WorkerCommand, width: usize) -> std::io::Result<Child> {
    let mut child = Command::new(&worker.program)
        .args(&worker.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    debug!(worker = %worker.name, pid = ?child.id(), "worker process spawned");

    let prefix = format!("{:>width$} | ", worker.name);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(relay_lines(stdout, prefix.clone(), false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_lines(stderr, prefix, true));
    }
    Ok(child)
}

/// Copy a child's output line by line under its name.
async fn relay_lines<R: AsyncRead + Unpin>(reader: R, prefix: String, to_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if to_stderr {
            eprintln!("{prefix}{line}");
        } else {
            println!("{prefix}{line}");
        }
    }
}

/// Ask politely, then kill once `grace` is up.
async fn stop_child(child: &mut Child, name: &str, grace: Duration) {
    request_stop(child).await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(worker = %name, "worker process exited after stop request"),
        Err(_) => {
            warn!(worker = %name, grace_ms = grace.as_millis() as u64, "worker ignored stop request, killing it");
            if let Err(e) = child.kill().await {
                warn!(worker = %name, error = %e, "kill failed");
            }
        }
    }
}

/// SIGTERM lets the worker say goodbye; without it the process is killed.
async fn request_stop(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let sent = Command::new("kill").arg("-TERM").arg(pid.to_string()).status().await;
            if sent.is_ok_and(|status| status.success()) {
                return;
            }
        }
    }
    let _ = child.start_kill();
}
