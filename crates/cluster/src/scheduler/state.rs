//! Authoritative scheduler state.
//!
//! One task owns a [`SchedulerState`] and feeds it every inbound event. Each
//! handler takes the current [`Instant`], mutates the state and returns the
//! [`Command`]s the network layer must send. Nothing here touches a socket
//! or a clock, so every scheduling decision is reproducible in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use stellwerk_core::{ExecError, Graph, GraphError, Key, Task, TaskExecutionError, Value};
use stellwerk_wire::protocol::{
    AssignTask, ClientId, DependencyLocation, DiagnosticsSnapshot, Holder, RemoteError, ResultFailed,
    ResultReady, SubmissionId, SubmissionInfo, SubmissionStatus, TaskFailure, TaskInfo, TaskRef,
    TaskStatus, WorkerId, WorkerInfo,
};
use tracing::{debug, info, warn};

use super::placement::{self, Candidate};
use super::types::{
    ClientRecord, Command, StateConfig, SubmissionRecord, TaskRecord, UnknownWorker, WorkerRecord,
};

/// Commands produced while handling one event. Releases are batched per
/// worker and emitted after everything else.
#[derive(Default)]
struct Outbox {
    commands: Vec<Command>,
    releases: BTreeMap<WorkerId, Vec<TaskRef>>,
}

impl Outbox {
    fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    fn release(&mut self, worker: WorkerId, task: TaskRef) {
        self.releases.entry(worker).or_default().push(task);
    }

    fn finish(self) -> Vec<Command> {
        let mut commands = self.commands;
        commands.extend(self.releases.into_iter().map(|(worker, tasks)| Command::Release { worker, tasks }));
        commands
    }
}

#[derive(Debug)]
pub struct SchedulerState {
    config: StateConfig,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    next_worker: u64,
    submissions: BTreeMap<SubmissionId, SubmissionRecord>,
    next_submission: u64,
    /// Ready tasks: older submissions first, then topological position.
    ready: BTreeSet<(SubmissionId, usize)>,
    clients: BTreeMap<ClientId, ClientRecord>,
}

impl SchedulerState {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            workers: BTreeMap::new(),
            next_worker: 1,
            submissions: BTreeMap::new(),
            next_submission: 1,
            ready: BTreeSet::new(),
            clients: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    // ── Workers ──────────────────────────────────────────────────────

    pub fn register_worker(
        &mut self,
        name: impl Into<String>,
        address: impl Into<String>,
        capacity: u32,
        now: Instant,
    ) -> (WorkerId, Vec<Command>) {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        let record = WorkerRecord {
            name: name.into(),
            address: address.into(),
            capacity,
            running: BTreeSet::new(),
            held: BTreeMap::new(),
            memory_bytes: 0,
            last_seen: now,
        };
        info!(worker_id = %id, name = %record.name, address = %record.address, capacity, "worker registered");
        self.workers.insert(id, record);

        let mut out = Outbox::default();
        self.schedule(&mut out);
        (id, out.finish())
    }

    pub fn heartbeat(&mut self, worker: WorkerId, memory_bytes: u64, now: Instant) -> Result<(), UnknownWorker> {
        let record = self.workers.get_mut(&worker).ok_or(UnknownWorker(worker))?;
        record.last_seen = now;
        record.memory_bytes = memory_bytes;
        Ok(())
    }

    /// Any frame from a registered worker counts as a sign of life. Returns
    /// false for workers the scheduler no longer knows.
    pub fn touch_worker(&mut self, worker: WorkerId, now: Instant) -> bool {
        match self.workers.get_mut(&worker) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Orderly departure; treated like a loss without waiting for a timeout.
    pub fn worker_left(&mut self, worker: WorkerId) -> Vec<Command> {
        let mut out = Outbox::default();
        self.remove_worker(worker, "worker said goodbye", &mut out);
        self.schedule(&mut out);
        out.finish()
    }

    /// An assignment could not be delivered to `worker`.
    pub fn assignment_failed(&mut self, worker: WorkerId, task: &TaskRef) -> Vec<Command> {
        let err = ExecError::WorkerUnavailable(format!("{worker} unreachable while assigning {task}"));
        warn!(worker_id = %worker, task = %task, error = %err, "assignment failed");
        let mut out = Outbox::default();
        self.remove_worker(worker, "assignment undeliverable", &mut out);
        self.schedule(&mut out);
        out.finish()
    }

    pub fn task_finished(
        &mut self,
        worker: WorkerId,
        task: TaskRef,
        nbytes: u64,
        value: Option<Value>,
        now: Instant,
    ) -> Vec<Command> {
        let mut out = Outbox::default();
        let Some(record) = self.workers.get_mut(&worker) else {
            return self.late_result(worker, task, value);
        };
        record.last_seen = now;
        record.running.remove(&task);

        let sid = task.submission;
        let Some((sub, idx)) = locate(&mut self.submissions, &task) else {
            out.release(worker, task);
            return out.finish();
        };
        let t = &mut sub.tasks[idx];
        if sub.status != SubmissionStatus::Running || t.status != TaskStatus::Running || t.worker != Some(worker) {
            debug!(worker_id = %worker, task = %task, status = ?t.status, "discarding stale result");
            out.release(worker, task);
            return out.finish();
        }

        t.status = TaskStatus::Memory;
        t.worker = None;
        t.nbytes = nbytes;
        t.holders.insert(worker);
        if let Some(record) = self.workers.get_mut(&worker) {
            record.held.insert(task.clone(), nbytes);
        }
        debug!(worker_id = %worker, task = %task, nbytes, "task finished");

        let mut missing_value = false;
        if t.is_target {
            match value {
                Some(v) => {
                    for client in sub.waiting.remove(&idx).unwrap_or_default() {
                        out.push(Command::Deliver {
                            client,
                            result: ResultReady { submission: sid, key: t.key.clone(), value: v.clone() },
                        });
                    }
                    t.value = Some(v);
                }
                None => missing_value = true,
            }
        }
        if missing_value {
            let err = RemoteError::Unknown(format!("{worker} returned no value for target {task}"));
            self.fail_submission(sid, err, &mut out);
            self.schedule(&mut out);
            return out.finish();
        }

        let dependents = t.dependents.clone();
        let deps = t.deps.clone();
        for d in dependents {
            if sub.tasks[d].status == TaskStatus::Waiting && deps_held(sub, d) {
                sub.tasks[d].status = TaskStatus::Ready;
                self.ready.insert((sid, d));
            }
        }

        if sub.targets().all(|i| sub.tasks[i].value.is_some()) {
            sub.status = SubmissionStatus::Finished;
            info!(submission = %sid, "submission finished");
        }

        self.maybe_release(sid, idx, &mut out);
        for d in deps {
            self.maybe_release(sid, d, &mut out);
        }
        self.schedule(&mut out);
        out.finish()
    }

    /// A result from a worker that was already written off, for instance
    /// after its heartbeats stalled. A target value that no other worker has
    /// picked up yet is kept on the scheduler; anything else is dropped.
    fn late_result(&mut self, worker: WorkerId, task: TaskRef, value: Option<Value>) -> Vec<Command> {
        let mut out = Outbox::default();
        let sid = task.submission;
        let Some((sub, idx)) = locate(&mut self.submissions, &task) else {
            return Vec::new();
        };
        let t = &sub.tasks[idx];
        let unclaimed = sub.status == SubmissionStatus::Running
            && t.is_target
            && matches!(t.status, TaskStatus::Waiting | TaskStatus::Ready)
            && !t.dependents.iter().any(|&d| sub.tasks[d].is_pending());
        let (true, Some(value)) = (unclaimed, value) else {
            debug!(worker_id = %worker, task = %task, status = ?t.status, "result from unknown worker ignored");
            return Vec::new();
        };

        info!(worker_id = %worker, task = %task, "keeping result from a worker written off earlier");
        self.ready.remove(&(sid, idx));
        let t = &mut sub.tasks[idx];
        // No worker holds a copy; the scheduler keeps the value for clients.
        t.status = TaskStatus::Released;
        for client in sub.waiting.remove(&idx).unwrap_or_default() {
            out.push(Command::Deliver {
                client,
                result: ResultReady { submission: sid, key: t.key.clone(), value: value.clone() },
            });
        }
        t.value = Some(value);
        let deps = t.deps.clone();

        if sub.targets().all(|i| sub.tasks[i].value.is_some()) {
            sub.status = SubmissionStatus::Finished;
            info!(submission = %sid, "submission finished");
        }
        for d in deps {
            self.maybe_release(sid, d, &mut out);
        }
        self.schedule(&mut out);
        out.finish()
    }

    pub fn task_failed(&mut self, worker: WorkerId, task: TaskRef, failure: TaskFailure, now: Instant) -> Vec<Command> {
        let mut out = Outbox::default();
        let Some(record) = self.workers.get_mut(&worker) else {
            return Vec::new();
        };
        record.last_seen = now;
        record.running.remove(&task);

        let sid = task.submission;
        let Some((sub, idx)) = locate(&mut self.submissions, &task) else {
            return Vec::new();
        };
        let t = &mut sub.tasks[idx];
        if sub.status != SubmissionStatus::Running || t.status != TaskStatus::Running || t.worker != Some(worker) {
            return Vec::new();
        }
        t.worker = None;

        match failure {
            TaskFailure::Execution { message } => {
                t.status = TaskStatus::Failed;
                let err = TaskExecutionError::new(t.key.clone(), message);
                warn!(submission = %sid, key = %t.key, error = %err, "task failed");
                self.fail_submission(sid, RemoteError::Task(err), &mut out);
            }
            TaskFailure::MissingDependency { key } => {
                warn!(task = %task, dependency = %key, "dependency could not be fetched, requeueing");
                t.status = TaskStatus::Waiting;
                if let Some(&dep) = sub.index.get(&key) {
                    let dep_ref = sub.task_ref(dep);
                    for holder in std::mem::take(&mut sub.tasks[dep].holders) {
                        if let Some(w) = self.workers.get_mut(&holder) {
                            w.held.remove(&dep_ref);
                        }
                    }
                }
                require(sub, &mut self.ready, idx);
            }
        }
        self.schedule(&mut out);
        out.finish()
    }

    /// Drop workers and clients whose heartbeats have lapsed.
    pub fn check_heartbeats(&mut self, now: Instant) -> Vec<Command> {
        let mut out = Outbox::default();

        let lost: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.last_seen) > self.config.heartbeat_timeout)
            .map(|(id, _)| *id)
            .collect();
        for worker in lost {
            let err = ExecError::WorkerLost(format!("{worker} missed heartbeats"));
            warn!(worker_id = %worker, error = %err, "worker lost");
            self.remove_worker(worker, "heartbeat timeout", &mut out);
        }

        let gone: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) > self.config.client_timeout)
            .map(|(id, _)| *id)
            .collect();
        for client in gone {
            warn!(client = %client, "client heartbeat lapsed");
            self.drop_client(client, &mut out);
        }

        self.submissions.retain(|sid, sub| {
            let keep = sub.status == SubmissionStatus::Running || sub.has_interest();
            if !keep {
                debug!(submission = %sid, status = ?sub.status, "forgetting submission");
            }
            keep
        });

        self.schedule(&mut out);
        out.finish()
    }

    // ── Clients ──────────────────────────────────────────────────────

    /// Validate and enqueue a graph. The submitting client holds interest in
    /// every target and is pushed each one as it completes.
    pub fn submit(
        &mut self,
        client: ClientId,
        tasks: Vec<(Key, Task)>,
        targets: &[Key],
        now: Instant,
    ) -> Result<(SubmissionId, Vec<Command>), GraphError> {
        self.touch_client(client, now);
        let graph = Graph::build(tasks)?;
        let culled = graph.cull(targets)?;
        let order = culled.topological_order(targets)?.to_vec();

        let sid = SubmissionId(self.next_submission);
        self.next_submission += 1;

        let mut records: Vec<TaskRecord> = order
            .iter()
            .filter_map(|k| culled.get(k.as_str()).map(|t| (k.clone(), t.clone())))
            .map(|(key, definition)| TaskRecord {
                is_target: targets.contains(&key),
                key,
                definition,
                deps: Vec::new(),
                dependents: Vec::new(),
                status: TaskStatus::Waiting,
                worker: None,
                holders: BTreeSet::new(),
                nbytes: 0,
                attempts: 0,
                value: None,
            })
            .collect();
        let index: BTreeMap<Key, usize> = records.iter().enumerate().map(|(i, t)| (t.key.clone(), i)).collect();
        for i in 0..records.len() {
            let deps: Vec<usize> =
                records[i].definition.dependencies().iter().filter_map(|k| index.get(k).copied()).collect();
            for &d in &deps {
                records[d].dependents.push(i);
            }
            records[i].deps = deps;
        }

        let targets_idx: Vec<usize> =
            records.iter().enumerate().filter(|(_, t)| t.is_target).map(|(i, _)| i).collect();
        let mut sub = SubmissionRecord {
            id: sid,
            tasks: records,
            index,
            status: SubmissionStatus::Running,
            failure: None,
            interest: targets_idx.iter().map(|&i| (i, BTreeSet::from([client]))).collect(),
            waiting: targets_idx.iter().map(|&i| (i, BTreeSet::from([client]))).collect(),
        };
        for (i, t) in sub.tasks.iter_mut().enumerate() {
            if t.deps.is_empty() {
                t.status = TaskStatus::Ready;
                self.ready.insert((sid, i));
            }
        }
        if targets_idx.is_empty() {
            sub.status = SubmissionStatus::Finished;
        }
        info!(submission = %sid, client = %client, tasks = sub.tasks.len(), targets = targets_idx.len(), "submission accepted");
        self.submissions.insert(sid, sub);

        let mut out = Outbox::default();
        self.schedule(&mut out);
        Ok((sid, out.finish()))
    }

    /// Ask for `keys` to be pushed to `client`, taking interest in them.
    pub fn gather(&mut self, client: ClientId, submission: SubmissionId, keys: &[Key], now: Instant) -> Vec<Command> {
        self.touch_client(client, now);
        let mut out = Outbox::default();
        let fail = |key: &Key, error: RemoteError| Command::Fail {
            client,
            failure: ResultFailed { submission, key: key.clone(), error },
        };

        let Some(sub) = self.submissions.get_mut(&submission) else {
            for key in keys {
                out.push(fail(key, RemoteError::Unknown(format!("unknown submission {submission}"))));
            }
            return out.finish();
        };
        for key in keys {
            let Some(idx) = sub.index.get(key).copied().filter(|&i| sub.tasks[i].is_target) else {
                out.push(fail(key, RemoteError::Unknown(format!("'{key}' is not a target of {submission}"))));
                continue;
            };
            match sub.status {
                SubmissionStatus::Failed | SubmissionStatus::Cancelled => {
                    out.push(fail(key, sub.failure.clone().unwrap_or(RemoteError::Cancelled)));
                }
                SubmissionStatus::Running | SubmissionStatus::Finished => {
                    let t = &sub.tasks[idx];
                    if let Some(value) = &t.value {
                        out.push(Command::Deliver {
                            client,
                            result: ResultReady { submission, key: key.clone(), value: value.clone() },
                        });
                        sub.interest.entry(idx).or_default().insert(client);
                    } else if t.status == TaskStatus::Released {
                        out.push(fail(key, RemoteError::Unknown(format!("result for '{key}' was released"))));
                    } else {
                        sub.interest.entry(idx).or_default().insert(client);
                        sub.waiting.entry(idx).or_default().insert(client);
                    }
                }
            }
        }
        out.finish()
    }

    /// `client` dropped its last handle on `keys`.
    pub fn release(&mut self, client: ClientId, submission: SubmissionId, keys: &[Key], now: Instant) -> Vec<Command> {
        self.touch_client(client, now);
        let mut out = Outbox::default();
        let Some(sub) = self.submissions.get_mut(&submission) else {
            return Vec::new();
        };
        let released: Vec<usize> = keys.iter().filter_map(|k| sub.index.get(k).copied()).collect();
        for &idx in &released {
            if let Some(clients) = sub.interest.get_mut(&idx) {
                clients.remove(&client);
            }
            if let Some(clients) = sub.waiting.get_mut(&idx) {
                clients.remove(&client);
            }
        }
        for idx in released {
            self.maybe_release(submission, idx, &mut out);
        }
        self.abandon_if_unwanted(submission, &mut out);
        self.schedule(&mut out);
        out.finish()
    }

    pub fn cancel(&mut self, client: ClientId, submission: SubmissionId, now: Instant) -> Vec<Command> {
        self.touch_client(client, now);
        let mut out = Outbox::default();
        if self.submissions.get(&submission).is_some_and(|s| s.status == SubmissionStatus::Running) {
            info!(submission = %submission, client = %client, "submission cancelled");
            self.fail_submission(submission, RemoteError::Cancelled, &mut out);
        }
        self.schedule(&mut out);
        out.finish()
    }

    pub fn client_heartbeat(&mut self, client: ClientId, now: Instant) {
        self.touch_client(client, now);
    }

    /// Release everything `client` held interest in.
    pub fn client_disconnected(&mut self, client: ClientId) -> Vec<Command> {
        let mut out = Outbox::default();
        self.drop_client(client, &mut out);
        self.schedule(&mut out);
        out.finish()
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    pub fn snapshot(&self, now: Instant) -> DiagnosticsSnapshot {
        let submissions = self
            .submissions
            .values()
            .map(|sub| SubmissionInfo {
                id: sub.id,
                status: sub.status,
                tasks: sub.tasks.len(),
                finished: sub.finished_count(),
                clients: sub.interest.values().flatten().collect::<BTreeSet<_>>().len(),
            })
            .collect();
        let tasks = self
            .submissions
            .values()
            .flat_map(|sub| {
                sub.tasks.iter().map(move |t| TaskInfo {
                    submission: sub.id,
                    key: t.key.clone(),
                    status: t.status,
                    worker: t.worker.or_else(|| t.holders.iter().next().copied()),
                    attempts: t.attempts,
                })
            })
            .collect();
        let workers = self
            .workers
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: *id,
                name: w.name.clone(),
                address: w.address.clone(),
                capacity: w.capacity,
                running: w.running.len() as u32,
                held: w.held.len() as u32,
                memory_bytes: w.memory_bytes,
                last_heartbeat_ms: now.saturating_duration_since(w.last_seen).as_millis() as u64,
            })
            .collect();
        DiagnosticsSnapshot { submissions, tasks, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_worker(&self, worker: WorkerId) -> bool {
        self.workers.contains_key(&worker)
    }

    pub fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn submission_status(&self, submission: SubmissionId) -> Option<SubmissionStatus> {
        self.submissions.get(&submission).map(|s| s.status)
    }

    pub fn task_status(&self, submission: SubmissionId, key: &str) -> Option<TaskStatus> {
        let sub = self.submissions.get(&submission)?;
        sub.index.get(key).map(|&i| sub.tasks[i].status)
    }

    /// Workers holding the result of `key`.
    pub fn holders(&self, submission: SubmissionId, key: &str) -> Vec<WorkerId> {
        self.submissions
            .get(&submission)
            .and_then(|sub| sub.index.get(key).map(|&i| sub.tasks[i].holders.iter().copied().collect()))
            .unwrap_or_default()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn touch_client(&mut self, client: ClientId, now: Instant) {
        self.clients.entry(client).or_insert(ClientRecord { last_seen: now }).last_seen = now;
    }

    fn drop_client(&mut self, client: ClientId, out: &mut Outbox) {
        self.clients.remove(&client);
        let sids: Vec<SubmissionId> = self.submissions.keys().copied().collect();
        for sid in sids {
            let Some(sub) = self.submissions.get_mut(&sid) else { continue };
            let mut touched = Vec::new();
            for (idx, clients) in sub.interest.iter_mut() {
                if clients.remove(&client) {
                    touched.push(*idx);
                }
            }
            for clients in sub.waiting.values_mut() {
                clients.remove(&client);
            }
            for idx in touched {
                self.maybe_release(sid, idx, out);
            }
            self.abandon_if_unwanted(sid, out);
        }
    }

    /// A running submission nobody is interested in any more is cancelled.
    fn abandon_if_unwanted(&mut self, sid: SubmissionId, out: &mut Outbox) {
        let Some(sub) = self.submissions.get(&sid) else { return };
        if sub.status == SubmissionStatus::Running && !sub.has_interest() {
            info!(submission = %sid, "no client interest left, cancelling");
            self.fail_submission(sid, RemoteError::Cancelled, out);
        }
    }

    fn remove_worker(&mut self, worker: WorkerId, reason: &str, out: &mut Outbox) {
        let Some(record) = self.workers.remove(&worker) else { return };
        warn!(worker_id = %worker, reason, running = record.running.len(), held = record.held.len(), "removing worker");

        // Copies that lived there first, so requeued tasks see what is gone.
        for task in record.held.keys() {
            let Some((sub, idx)) = locate(&mut self.submissions, task) else { continue };
            sub.tasks[idx].holders.remove(&worker);
            if sub.status == SubmissionStatus::Running
                && sub.tasks[idx].status == TaskStatus::Memory
                && sub.tasks[idx].holders.is_empty()
            {
                holder_lost(sub, &mut self.ready, idx);
            }
        }

        let mut exhausted = Vec::new();
        for task in &record.running {
            let max_retries = self.config.max_retries;
            let Some((sub, idx)) = locate(&mut self.submissions, task) else { continue };
            let t = &mut sub.tasks[idx];
            if sub.status != SubmissionStatus::Running || t.status != TaskStatus::Running || t.worker != Some(worker) {
                continue;
            }
            t.worker = None;
            t.attempts += 1;
            if t.attempts > max_retries {
                t.status = TaskStatus::Failed;
                exhausted.push((task.submission, t.key.clone(), t.attempts));
                continue;
            }
            info!(task = %task, attempts = t.attempts, "rescheduling task from lost worker");
            t.status = TaskStatus::Waiting;
            require(sub, &mut self.ready, idx);
        }

        for (sid, key, attempts) in exhausted {
            warn!(submission = %sid, key = %key, attempts, "retry budget exhausted");
            self.fail_submission(sid, RemoteError::SubmissionFailed { key, attempts }, out);
        }
    }

    /// End a running submission: stop dispatch, release held results and
    /// tell every interested client.
    fn fail_submission(&mut self, sid: SubmissionId, error: RemoteError, out: &mut Outbox) {
        let Some(sub) = self.submissions.get_mut(&sid) else { return };
        if sub.status != SubmissionStatus::Running {
            return;
        }
        sub.status = match error {
            RemoteError::Cancelled => SubmissionStatus::Cancelled,
            _ => SubmissionStatus::Failed,
        };
        sub.failure = Some(error.clone());

        for (i, t) in sub.tasks.iter_mut().enumerate() {
            if t.is_pending() {
                self.ready.remove(&(sid, i));
                t.status = TaskStatus::Cancelled;
            }
        }
        for i in 0..sub.tasks.len() {
            release_result(&mut self.workers, sub, i, out);
        }

        let mut notified: BTreeSet<(usize, ClientId)> = BTreeSet::new();
        for (&idx, clients) in sub.interest.iter().chain(sub.waiting.iter()) {
            for &client in clients {
                notified.insert((idx, client));
            }
        }
        for (idx, client) in notified {
            out.push(Command::Fail {
                client,
                failure: ResultFailed { submission: sid, key: sub.tasks[idx].key.clone(), error: error.clone() },
            });
        }
        sub.interest.clear();
        sub.waiting.clear();
    }

    fn maybe_release(&mut self, sid: SubmissionId, idx: usize, out: &mut Outbox) {
        let Some(sub) = self.submissions.get_mut(&sid) else { return };
        if sub.tasks[idx].status == TaskStatus::Memory && !needed(sub, idx) {
            release_result(&mut self.workers, sub, idx, out);
        }
    }

    /// Hand ready tasks to workers with free slots.
    fn schedule(&mut self, out: &mut Outbox) {
        while let Some(&(sid, idx)) = self.ready.first() {
            if !self.workers.values().any(WorkerRecord::has_free_slot) {
                break;
            }
            self.ready.remove(&(sid, idx));
            let Some(sub) = self.submissions.get_mut(&sid) else { continue };
            if sub.status != SubmissionStatus::Running || sub.tasks[idx].status != TaskStatus::Ready {
                continue;
            }
            if !deps_held(sub, idx) {
                sub.tasks[idx].status = TaskStatus::Waiting;
                require(sub, &mut self.ready, idx);
                continue;
            }

            let workers = &self.workers;
            let deps = &sub.tasks[idx].deps;
            let candidates = workers.iter().map(|(id, w)| Candidate {
                id: *id,
                running: w.running.len() as u64,
                capacity: u64::from(w.capacity),
                locality: deps
                    .iter()
                    .filter(|&&d| sub.tasks[d].holders.contains(id))
                    .map(|&d| sub.tasks[d].nbytes)
                    .sum(),
            });
            let Some(chosen) = placement::choose(candidates) else {
                self.ready.insert((sid, idx));
                break;
            };

            let dependencies = deps
                .iter()
                .map(|&d| DependencyLocation {
                    key: sub.tasks[d].key.clone(),
                    holders: sub.tasks[d]
                        .holders
                        .iter()
                        .filter_map(|h| {
                            workers.get(h).map(|w| Holder { worker_id: *h, address: w.address.clone() })
                        })
                        .collect(),
                })
                .collect();
            let task = sub.task_ref(idx);
            let t = &mut sub.tasks[idx];
            t.status = TaskStatus::Running;
            t.worker = Some(chosen);
            if let Some(w) = self.workers.get_mut(&chosen) {
                w.running.insert(task.clone());
            }
            debug!(task = %task, worker_id = %chosen, "assigning task");
            out.push(Command::Assign {
                worker: chosen,
                assignment: AssignTask { task, definition: t.definition.clone(), dependencies, report_value: t.is_target },
            });
        }
    }
}

fn locate<'a>(
    submissions: &'a mut BTreeMap<SubmissionId, SubmissionRecord>,
    task: &TaskRef,
) -> Option<(&'a mut SubmissionRecord, usize)> {
    let sub = submissions.get_mut(&task.submission)?;
    let idx = sub.index.get(&task.key).copied()?;
    Some((sub, idx))
}

fn deps_held(sub: &SubmissionRecord, idx: usize) -> bool {
    sub.tasks[idx].deps.iter().all(|&d| sub.tasks[d].is_held())
}

/// Whether workers must keep the result of `idx`: a dependent still has to
/// run, or a client holds interest in it.
fn needed(sub: &SubmissionRecord, idx: usize) -> bool {
    let t = &sub.tasks[idx];
    let pending_dependent =
        sub.status == SubmissionStatus::Running && t.dependents.iter().any(|&d| sub.tasks[d].is_pending());
    let interested = t.is_target && sub.interest.get(&idx).is_some_and(|c| !c.is_empty());
    pending_dependent || interested
}

fn release_result(
    workers: &mut BTreeMap<WorkerId, WorkerRecord>,
    sub: &mut SubmissionRecord,
    idx: usize,
    out: &mut Outbox,
) {
    let task = sub.task_ref(idx);
    let t = &mut sub.tasks[idx];
    for holder in std::mem::take(&mut t.holders) {
        if let Some(w) = workers.get_mut(&holder) {
            w.held.remove(&task);
        }
        out.release(holder, task.clone());
    }
    t.value = None;
    if t.status == TaskStatus::Memory {
        t.status = TaskStatus::Released;
        debug!(task = %task, "result released");
    }
}

/// Make sure `idx` will be (re)computed, recursing into dependencies whose
/// results are gone.
fn require(sub: &mut SubmissionRecord, ready: &mut BTreeSet<(SubmissionId, usize)>, idx: usize) {
    match sub.tasks[idx].status {
        TaskStatus::Ready | TaskStatus::Running | TaskStatus::Failed | TaskStatus::Cancelled => return,
        TaskStatus::Memory if !sub.tasks[idx].holders.is_empty() => return,
        TaskStatus::Memory | TaskStatus::Released => {
            debug!(submission = %sub.id, key = %sub.tasks[idx].key, "recomputing lost result");
            sub.tasks[idx].status = TaskStatus::Waiting;
        }
        TaskStatus::Waiting => {}
    }
    let deps = sub.tasks[idx].deps.clone();
    for d in deps {
        require(sub, ready, d);
    }
    if deps_held(sub, idx) {
        sub.tasks[idx].status = TaskStatus::Ready;
        ready.insert((sub.id, idx));
    }
}

/// The last copy of `idx` is gone. Recompute it if a dependent still needs
/// it; ready dependents go back to waiting.
fn holder_lost(sub: &mut SubmissionRecord, ready: &mut BTreeSet<(SubmissionId, usize)>, idx: usize) {
    let pending: Vec<usize> =
        sub.tasks[idx].dependents.iter().copied().filter(|&d| sub.tasks[d].is_pending()).collect();
    if pending.is_empty() {
        return;
    }
    for d in pending {
        if sub.tasks[d].status == TaskStatus::Ready {
            sub.tasks[d].status = TaskStatus::Waiting;
            ready.remove(&(sub.id, d));
        }
    }
    require(sub, ready, idx);
}
