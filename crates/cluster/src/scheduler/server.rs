//! Socket loop around [`SchedulerState`].
//!
//! A single tokio task owns the state. It multiplexes inbound requests from
//! workers and clients with a heartbeat tick, executes the resulting
//! [`Command`]s and publishes a [`DiagnosticsSnapshot`] after every tick.
//!
//! Outbound frames are posted, never awaited, so a slow or vanished peer
//! cannot hold up the loop. Assignments the socket refuses come back on the
//! undelivered channel and are moved to another worker.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::Serialize;
use stellwerk_wire::protocol::{
    AssignTask, Cancel, ClientHello, ClientId, DiagnosticsSnapshot, Gather, RegisterAck, RegisterWorker,
    Release, ReleaseResults, Submit, SubmitReply, TaskFailed, TaskFinished, WorkerEvicted, WorkerGoodbye,
    WorkerHeartbeat, WorkerId,
};
use stellwerk_wire::{
    topics, Message, ReplyToken, RequestHandler, Transport, Undelivered, WireError, ZmqRequestServer,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::diagnostics::spawn_diagnostics_server;
use super::state::SchedulerState;
use super::types::{Command, StateConfig};
use crate::config::SchedulerSection;
use crate::error::ClusterError;

pub struct SchedulerServer {
    config: SchedulerSection,
}

/// A running scheduler. Dropping the handle does not stop it; call
/// [`SchedulerHandle::shutdown`].
pub struct SchedulerHandle {
    endpoint: String,
    snapshots: watch::Receiver<DiagnosticsSnapshot>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    dashboard: Option<JoinHandle<()>>,
}

impl SchedulerServer {
    pub fn new(config: SchedulerSection) -> Self {
        Self { config }
    }

    /// Bind the scheduler socket and start serving.
    ///
    /// Fails when the bind address is malformed or already in use.
    pub async fn start(self) -> Result<SchedulerHandle, ClusterError> {
        let transport = Transport::parse(&self.config.bind_address)?;
        let server = ZmqRequestServer::bind(&transport).await?;
        let endpoint = server.endpoint().to_string();

        let state = SchedulerState::new(StateConfig::from(&self.config));
        let (snapshot_tx, snapshots) = watch::channel(state.snapshot(Instant::now()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let dashboard =
            self.config.dashboard_port.map(|port| spawn_diagnostics_server(port, snapshots.clone(), shutdown_rx.clone()));

        let undelivered = server
            .take_undelivered()
            .ok_or_else(|| ClusterError::Runtime("scheduler socket already in use".into()))?;
        let router = Router { server, state, workers: HashMap::new(), clients: HashMap::new(), snapshot_tx };
        let task = tokio::spawn(router.run(undelivered, shutdown_rx));

        info!(
            endpoint = %endpoint,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            max_retries = self.config.max_retries,
            "scheduler started"
        );
        Ok(SchedulerHandle { endpoint, snapshots, shutdown, task, dashboard })
    }
}

impl SchedulerHandle {
    /// Resolved address workers and clients connect to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Latest snapshot published by the scheduler loop.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiagnosticsSnapshot> {
        self.snapshots.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the scheduler loop to stop.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "scheduler loop panicked");
            }
        }
        if let Some(dashboard) = self.dashboard {
            let _ = dashboard.await;
        }
    }
}

struct Router {
    server: ZmqRequestServer,
    state: SchedulerState,
    workers: HashMap<WorkerId, ReplyToken>,
    clients: HashMap<ClientId, ReplyToken>,
    snapshot_tx: watch::Sender<DiagnosticsSnapshot>,
}

impl Router {
    async fn run(mut self, mut undelivered: mpsc::UnboundedReceiver<Undelivered>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.state.config().heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.server.recv_request() => match request {
                    Ok((token, message)) => self.handle(token, message),
                    Err(e) => {
                        error!(error = %e, "scheduler socket closed");
                        break;
                    }
                },
                Some(bounced) = undelivered.recv() => self.bounced(bounced),
                _ = tick.tick() => {
                    // Whatever already arrived is evidence of life; read it
                    // before judging heartbeats.
                    while let Some((token, message)) = self.server.try_recv_request() {
                        self.handle(token, message);
                    }
                    let now = Instant::now();
                    let commands = self.state.check_heartbeats(now);
                    self.execute(commands);
                    let state = &self.state;
                    self.workers.retain(|id, _| state.has_worker(*id));
                    self.clients.retain(|id, _| state.has_client(*id));
                    self.snapshot_tx.send_replace(self.state.snapshot(now));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(workers = self.state.worker_count(), "scheduler stopped");
    }

    fn handle(&mut self, token: ReplyToken, message: Message) {
        let now = Instant::now();
        if let Some(worker) = self.worker_behind(&token) {
            self.state.touch_worker(worker, now);
        }
        if let Err(e) = self.dispatch(&token, &message, now) {
            warn!(peer = %token, topic = %message.topic, error = %e, "failed to handle message");
        }
    }

    fn worker_behind(&self, token: &ReplyToken) -> Option<WorkerId> {
        self.workers.iter().find(|(_, t)| *t == token).map(|(id, _)| *id)
    }

    fn dispatch(&mut self, token: &ReplyToken, message: &Message, now: Instant) -> Result<(), WireError> {
        let commands = match message.topic.as_str() {
            topics::WORKER_REGISTER => {
                let req: RegisterWorker = message.decode()?;
                let (worker_id, commands) =
                    self.state.register_worker(req.name, req.data_address, req.capacity, now);
                self.workers.insert(worker_id, token.clone());
                let ack = RegisterAck {
                    worker_id,
                    heartbeat_interval_ms: self.state.config().heartbeat_interval.as_millis() as u64,
                };
                self.server.post(token, message.reply(topics::WORKER_REGISTER_REPLY, &ack)?)?;
                commands
            }
            topics::WORKER_HEARTBEAT => {
                let beat: WorkerHeartbeat = message.decode()?;
                if let Err(unknown) = self.state.heartbeat(beat.worker_id, beat.memory_bytes, now) {
                    warn!(worker_id = %beat.worker_id, "heartbeat from unknown worker, evicting");
                    let evicted = WorkerEvicted { reason: unknown.to_string() };
                    self.push(token, topics::SCHEDULER_EVICT, &evicted)?;
                }
                Vec::new()
            }
            topics::WORKER_FINISHED => {
                let done: TaskFinished = message.decode()?;
                self.state.task_finished(done.worker_id, done.task, done.nbytes, done.value, now)
            }
            topics::WORKER_FAILED => {
                let failed: TaskFailed = message.decode()?;
                self.state.task_failed(failed.worker_id, failed.task, failed.failure, now)
            }
            topics::WORKER_GOODBYE => {
                let bye: WorkerGoodbye = message.decode()?;
                info!(worker_id = %bye.worker_id, "worker leaving");
                self.workers.remove(&bye.worker_id);
                self.state.worker_left(bye.worker_id)
            }
            topics::CLIENT_SUBMIT => {
                let submit: Submit = message.decode()?;
                self.clients.insert(submit.client, token.clone());
                let (reply, commands) = match self.state.submit(submit.client, submit.tasks, &submit.targets, now) {
                    Ok((submission, commands)) => (SubmitReply::Accepted { submission }, commands),
                    Err(error) => {
                        info!(client = %submit.client, error = %error, "submission rejected");
                        (SubmitReply::Rejected { error }, Vec::new())
                    }
                };
                self.server.post(token, message.reply(topics::CLIENT_SUBMIT_REPLY, &reply)?)?;
                commands
            }
            topics::CLIENT_GATHER => {
                let gather: Gather = message.decode()?;
                self.clients.insert(gather.client, token.clone());
                self.state.gather(gather.client, gather.submission, &gather.keys, now)
            }
            topics::CLIENT_RELEASE => {
                let release: Release = message.decode()?;
                self.clients.insert(release.client, token.clone());
                self.state.release(release.client, release.submission, &release.keys, now)
            }
            topics::CLIENT_CANCEL => {
                let cancel: Cancel = message.decode()?;
                self.clients.insert(cancel.client, token.clone());
                self.state.cancel(cancel.client, cancel.submission, now)
            }
            topics::CLIENT_HEARTBEAT => {
                let hello: ClientHello = message.decode()?;
                self.clients.insert(hello.client, token.clone());
                self.state.client_heartbeat(hello.client, now);
                Vec::new()
            }
            topics::CLIENT_GOODBYE => {
                let hello: ClientHello = message.decode()?;
                self.clients.remove(&hello.client);
                self.state.client_disconnected(hello.client)
            }
            topics::CLIENT_DIAGNOSTICS => {
                let snapshot = self.state.snapshot(now);
                self.server.post(token, message.reply(topics::CLIENT_DIAGNOSTICS_REPLY, &snapshot)?)?;
                Vec::new()
            }
            other => {
                warn!(peer = %token, topic = other, "unknown topic");
                Vec::new()
            }
        };
        self.execute(commands);
        Ok(())
    }

    /// The socket refused a posted frame. Only lost assignments need action;
    /// clients and workers that vanished are caught by their heartbeats.
    fn bounced(&mut self, bounced: Undelivered) {
        if bounced.message.topic != topics::SCHEDULER_ASSIGN {
            debug!(peer = %bounced.token, topic = %bounced.message.topic, reason = %bounced.reason, "push not delivered");
            return;
        }
        let (Some(worker), Ok(assignment)) = (self.worker_behind(&bounced.token), bounced.message.decode::<AssignTask>())
        else {
            return;
        };
        warn!(worker_id = %worker, task = %assignment.task, reason = %bounced.reason, "could not deliver assignment");
        self.workers.remove(&worker);
        let commands = self.state.assignment_failed(worker, &assignment.task);
        self.execute(commands);
    }

    fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            match command {
                Command::Assign { worker, assignment } => {
                    let sent = match self.workers.get(&worker) {
                        Some(token) => self.push(token, topics::SCHEDULER_ASSIGN, &assignment),
                        None => Err(WireError::Transport(format!("no route to {worker}"))),
                    };
                    if let Err(e) = sent {
                        warn!(worker_id = %worker, task = %assignment.task, error = %e, "could not deliver assignment");
                        self.workers.remove(&worker);
                        queue.extend(self.state.assignment_failed(worker, &assignment.task));
                    }
                }
                Command::Release { worker, tasks } => {
                    let Some(token) = self.workers.get(&worker) else { continue };
                    if let Err(e) = self.push(token, topics::SCHEDULER_RELEASE, &ReleaseResults { tasks }) {
                        debug!(worker_id = %worker, error = %e, "could not deliver release");
                    }
                }
                Command::Deliver { client, result } => {
                    let Some(token) = self.clients.get(&client) else { continue };
                    if let Err(e) = self.push(token, topics::SCHEDULER_RESULT, &result) {
                        warn!(client = %client, key = %result.key, error = %e, "could not deliver result");
                    }
                }
                Command::Fail { client, failure } => {
                    let Some(token) = self.clients.get(&client) else { continue };
                    if let Err(e) = self.push(token, topics::SCHEDULER_RESULT_FAILED, &failure) {
                        warn!(client = %client, key = %failure.key, error = %e, "could not deliver failure");
                    }
                }
            }
        }
    }

    fn push<T: Serialize>(&self, token: &ReplyToken, topic: &str, payload: &T) -> Result<(), WireError> {
        self.server.post(token, Message::new(topic, payload)?)
    }
}
