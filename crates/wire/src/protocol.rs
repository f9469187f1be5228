//! Payloads carried inside [`Message`](crate::Message) envelopes.
//!
//! Each struct documents the topic it travels on.

use std::fmt;

use serde::{Deserialize, Serialize};
use stellwerk_core::{ExecError, GraphError, Key, Task, TaskExecutionError, Value};
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────

/// Worker id, assigned by the scheduler in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Submission id, assigned by the scheduler in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Client id, chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task key scoped to its submission. Keys are only unique per graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub submission: SubmissionId,
    pub key: Key,
}

impl TaskRef {
    pub fn new(submission: SubmissionId, key: Key) -> Self {
        Self { submission, key }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.submission, self.key)
    }
}

// ── Worker ↔ scheduler ───────────────────────────────────────────────

/// `stellwerk.worker.register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWorker {
    pub name: String,
    /// Where peers reach this worker's data socket.
    pub data_address: String,
    /// Tasks the worker runs at once.
    pub capacity: u32,
}

/// `stellwerk.worker.register.reply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub worker_id: WorkerId,
    pub heartbeat_interval_ms: u64,
}

/// `stellwerk.worker.heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub executing: u32,
    pub held: u32,
    pub memory_bytes: u64,
}

/// A worker holding a dependency's result, and where to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    pub worker_id: WorkerId,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyLocation {
    pub key: Key,
    pub holders: Vec<Holder>,
}

/// `stellwerk.scheduler.assign`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignTask {
    pub task: TaskRef,
    pub definition: Task,
    pub dependencies: Vec<DependencyLocation>,
    /// Send the value back with the completion; set for target keys.
    pub report_value: bool,
}

/// `stellwerk.worker.finished`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFinished {
    pub worker_id: WorkerId,
    pub task: TaskRef,
    pub nbytes: u64,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskFailure {
    /// The callable failed or panicked.
    Execution { message: String },
    /// None of the listed holders could serve this dependency.
    MissingDependency { key: Key },
}

/// `stellwerk.worker.failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    pub worker_id: WorkerId,
    pub task: TaskRef,
    pub failure: TaskFailure,
}

/// `stellwerk.scheduler.release`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseResults {
    pub tasks: Vec<TaskRef>,
}

/// `stellwerk.scheduler.evict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvicted {
    pub reason: String,
}

/// `stellwerk.worker.goodbye`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerGoodbye {
    pub worker_id: WorkerId,
}

// ── Worker ↔ worker ──────────────────────────────────────────────────

/// `stellwerk.peer.fetch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub task: TaskRef,
}

/// `stellwerk.peer.fetch.reply`. `None` when the peer no longer holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchReply {
    pub value: Option<Value>,
}

// ── Client ↔ scheduler ───────────────────────────────────────────────

/// `stellwerk.client.submit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submit {
    pub client: ClientId,
    pub tasks: Vec<(Key, Task)>,
    pub targets: Vec<Key>,
}

/// `stellwerk.client.submit.reply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitReply {
    Accepted { submission: SubmissionId },
    Rejected { error: GraphError },
}

/// `stellwerk.client.gather`: push these keys once they are available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gather {
    pub client: ClientId,
    pub submission: SubmissionId,
    pub keys: Vec<Key>,
}

/// `stellwerk.client.cancel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub client: ClientId,
    pub submission: SubmissionId,
}

/// `stellwerk.client.release`: the client dropped its last handle on `keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub client: ClientId,
    pub submission: SubmissionId,
    pub keys: Vec<Key>,
}

/// `stellwerk.client.heartbeat` and `stellwerk.client.goodbye`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client: ClientId,
}

/// `stellwerk.scheduler.result`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReady {
    pub submission: SubmissionId,
    pub key: Key,
    pub value: Value,
}

/// `stellwerk.scheduler.result.failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFailed {
    pub submission: SubmissionId,
    pub key: Key,
    pub error: RemoteError,
}

/// Failure of a submission as reported to its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteError {
    Task(TaskExecutionError),
    SubmissionFailed { key: Key, attempts: u32 },
    Cancelled,
    Graph(GraphError),
    Unknown(String),
}

impl From<RemoteError> for ExecError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Task(t) => ExecError::Task(t),
            RemoteError::SubmissionFailed { key, attempts } => ExecError::SubmissionFailed { key, attempts },
            RemoteError::Cancelled => ExecError::Cancelled,
            RemoteError::Graph(g) => ExecError::Graph(g),
            RemoteError::Unknown(m) => ExecError::Transport(m),
        }
    }
}

// ── Diagnostics ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Waiting,
    Ready,
    Running,
    /// Result held by at least one worker.
    Memory,
    /// Finished and dropped everywhere.
    Released,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Running,
    Finished,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionInfo {
    pub id: SubmissionId,
    pub status: SubmissionStatus,
    pub tasks: usize,
    pub finished: usize,
    pub clients: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub submission: SubmissionId,
    pub key: Key,
    pub status: TaskStatus,
    pub worker: Option<WorkerId>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub name: String,
    pub address: String,
    pub capacity: u32,
    pub running: u32,
    pub held: u32,
    pub memory_bytes: u64,
    /// Milliseconds since the last heartbeat.
    pub last_heartbeat_ms: u64,
}

/// `stellwerk.client.diagnostics.reply`, also served as JSON over HTTP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub submissions: Vec<SubmissionInfo>,
    pub tasks: Vec<TaskInfo>,
    pub workers: Vec<WorkerInfo>,
}

impl DiagnosticsSnapshot {
    pub fn task(&self, submission: SubmissionId, key: &str) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| t.submission == submission && t.key.as_str() == key)
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerInfo> {
        self.workers.iter().find(|w| w.id == id)
    }
}
