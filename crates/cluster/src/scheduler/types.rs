use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use stellwerk_core::{Key, Task, Value};
use stellwerk_wire::protocol::{
    AssignTask, ClientId, RemoteError, ResultFailed, ResultReady, SubmissionId, SubmissionStatus,
    TaskRef, TaskStatus, WorkerId,
};

use crate::config::SchedulerSection;

/// Knobs the state machine needs; the rest of the config is the server's.
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub client_timeout: Duration,
    pub max_retries: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for StateConfig {
    fn from(s: &SchedulerSection) -> Self {
        Self {
            heartbeat_interval: s.heartbeat_interval(),
            heartbeat_timeout: s.heartbeat_timeout(),
            client_timeout: s.client_timeout(),
            max_retries: s.max_retries,
        }
    }
}

/// Something the network layer must send on the state machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Assign { worker: WorkerId, assignment: AssignTask },
    Release { worker: WorkerId, tasks: Vec<TaskRef> },
    Deliver { client: ClientId, result: ResultReady },
    Fail { client: ClientId, failure: ResultFailed },
}

/// The worker named in a message is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownWorker(pub WorkerId);

impl std::fmt::Display for UnknownWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown worker {}", self.0)
    }
}

impl std::error::Error for UnknownWorker {}

#[derive(Debug)]
pub(crate) struct WorkerRecord {
    pub name: String,
    pub address: String,
    pub capacity: u32,
    pub running: BTreeSet<TaskRef>,
    /// Results this worker holds, with their sizes.
    pub held: BTreeMap<TaskRef, u64>,
    pub memory_bytes: u64,
    pub last_seen: Instant,
}

impl WorkerRecord {
    pub fn has_free_slot(&self) -> bool {
        (self.running.len() as u64) < u64::from(self.capacity)
    }
}

#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub key: Key,
    pub definition: Task,
    /// Positions of dependencies within the submission.
    pub deps: Vec<usize>,
    pub dependents: Vec<usize>,
    pub status: TaskStatus,
    /// Worker currently running the task.
    pub worker: Option<WorkerId>,
    pub holders: BTreeSet<WorkerId>,
    pub nbytes: u64,
    /// Worker losses suffered while running.
    pub attempts: u32,
    pub is_target: bool,
    /// Target value, kept while some client holds interest.
    pub value: Option<Value>,
}

impl TaskRecord {
    /// Result present on at least one worker.
    pub fn is_held(&self) -> bool {
        self.status == TaskStatus::Memory && !self.holders.is_empty()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, TaskStatus::Waiting | TaskStatus::Ready | TaskStatus::Running)
    }
}

#[derive(Debug)]
pub(crate) struct SubmissionRecord {
    pub id: SubmissionId,
    /// Tasks in topological order.
    pub tasks: Vec<TaskRecord>,
    pub index: BTreeMap<Key, usize>,
    pub status: SubmissionStatus,
    pub failure: Option<RemoteError>,
    /// Clients holding each target, by task position.
    pub interest: BTreeMap<usize, BTreeSet<ClientId>>,
    /// Clients still owed a push for each target.
    pub waiting: BTreeMap<usize, BTreeSet<ClientId>>,
}

impl SubmissionRecord {
    pub fn task_ref(&self, idx: usize) -> TaskRef {
        TaskRef::new(self.id, self.tasks[idx].key.clone())
    }

    pub fn targets(&self) -> impl Iterator<Item = usize> + '_ {
        self.tasks.iter().enumerate().filter(|(_, t)| t.is_target).map(|(i, _)| i)
    }

    pub fn has_interest(&self) -> bool {
        self.interest.values().any(|clients| !clients.is_empty())
    }

    pub fn finished_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Memory | TaskStatus::Released))
            .count()
    }
}

#[derive(Debug)]
pub(crate) struct ClientRecord {
    pub last_seen: Instant,
}
