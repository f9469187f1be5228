//! Cluster worker.
//!
//! A worker connects a DEALER socket to the scheduler, registers with its
//! thread count as capacity and then:
//! 1. runs assigned tasks on a rayon pool, fetching remote inputs from peers
//! 2. keeps results in a [`ResultStore`] until the scheduler releases them
//! 3. serves peer fetches on its own ROUTER data socket
//! 4. heartbeats at the interval the scheduler asked for

mod peer;
mod store;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use stellwerk_core::{Key, Registry, TaskExecutionError, Value};
use stellwerk_local::{resolve_pool_size, ExecutorMetrics};
use stellwerk_wire::protocol::{
    AssignTask, DependencyLocation, FetchReply, FetchResult, RegisterAck, RegisterWorker, ReleaseResults,
    TaskFailed, TaskFailure, TaskFinished, TaskRef, WorkerEvicted, WorkerGoodbye, WorkerHeartbeat, WorkerId,
};
use stellwerk_wire::{
    call, notify, topics, Message, ReplyToken, RequestHandler, Transport, WireError, ZmqRequestClient,
    ZmqRequestServer,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use peer::PeerPool;
pub use store::ResultStore;

use crate::config::WorkerSection;
use crate::error::ClusterError;

/// Time given to the socket loop to flush the goodbye before it is dropped.
const GOODBYE_GRACE: Duration = Duration::from_millis(100);

pub struct Worker;

/// A running worker.
pub struct WorkerHandle {
    worker_id: WorkerId,
    data_address: String,
    capacity: u32,
    ctx: Arc<WorkerContext>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ClusterError>>,
}

struct WorkerContext {
    worker_id: WorkerId,
    scheduler: ZmqRequestClient,
    registry: Arc<Registry>,
    pool: rayon::ThreadPool,
    store: ResultStore,
    peers: PeerPool,
    executing: AtomicU32,
    /// Set when the worker is torn down without a goodbye; nothing more is
    /// reported to the scheduler.
    halted: AtomicBool,
    metrics: Arc<RwLock<ExecutorMetrics>>,
}

impl Worker {
    /// Connect, register and start serving.
    ///
    /// Fails with [`ClusterError::SchedulerUnreachable`] when the scheduler
    /// does not answer within `startup_timeout`.
    pub async fn start(config: &WorkerSection, registry: Arc<Registry>) -> Result<WorkerHandle, ClusterError> {
        let unreachable = |reason: String| ClusterError::SchedulerUnreachable {
            address: config.scheduler_address.clone(),
            reason,
        };
        let timeout = config.startup_timeout();

        let transport = Transport::parse(&config.scheduler_address)?;
        let scheduler = ZmqRequestClient::connect_within(&transport, timeout)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let inbox = scheduler
            .take_inbox()
            .ok_or_else(|| ClusterError::Runtime("scheduler inbox already taken".into()))?;

        let data = ZmqRequestServer::bind(&Transport::tcp(config.listen_host.clone(), config.listen_port)).await?;
        let data_address = data.endpoint().to_string();

        let threads = resolve_pool_size(config.threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("stellwerk-task-{i}"))
            .build()
            .map_err(|e| ClusterError::Runtime(format!("failed to build task pool: {e}")))?;
        let capacity = u32::try_from(threads).unwrap_or(u32::MAX);

        let name = config.name.clone().unwrap_or_else(|| format!("worker-{}", std::process::id()));
        let register = RegisterWorker { name: name.clone(), data_address: data_address.clone(), capacity };
        let ack: RegisterAck =
            call(&scheduler, topics::WORKER_REGISTER, topics::WORKER_REGISTER_REPLY, &register, timeout)
                .await
                .map_err(|e| unreachable(e.to_string()))?;
        info!(
            worker_id = %ack.worker_id,
            name = %name,
            data_address = %data_address,
            capacity,
            "worker registered"
        );

        let ctx = Arc::new(WorkerContext {
            worker_id: ack.worker_id,
            scheduler,
            registry,
            pool,
            store: ResultStore::new(),
            peers: PeerPool::new(),
            executing: AtomicU32::new(0),
            halted: AtomicBool::new(false),
            metrics: Arc::new(RwLock::new(ExecutorMetrics::default())),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let interval = Duration::from_millis(ack.heartbeat_interval_ms.max(1));
        let task = tokio::spawn(Arc::clone(&ctx).run(inbox, data, interval, shutdown_rx));

        Ok(WorkerHandle { worker_id: ack.worker_id, data_address, capacity, ctx, shutdown, task })
    }
}

impl WorkerHandle {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Address peers fetch results from.
    pub fn data_address(&self) -> &str {
        &self.data_address
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Results currently held.
    pub fn held(&self) -> usize {
        self.ctx.store.len()
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        self.ctx.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Say goodbye to the scheduler and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop without a goodbye, as if the process had died. The scheduler
    /// notices through missed heartbeats.
    pub fn abort(&self) {
        self.ctx.halted.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    /// True once the worker loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to stop. Returns the reason it stopped on its own,
    /// such as eviction or a lost scheduler connection.
    pub async fn join(self) -> Result<(), ClusterError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ClusterError::Runtime(format!("worker loop panicked: {e}"))),
        }
    }
}

impl WorkerContext {
    async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        data: ZmqRequestServer,
        heartbeat_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let mut beat = tokio::time::interval(heartbeat_interval);
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => Arc::clone(&self).handle_scheduler_message(message)?,
                    None => return Err(ClusterError::Runtime("scheduler connection closed".into())),
                },
                request = data.recv_request() => {
                    let (token, message) = request?;
                    if let Err(e) = self.serve_fetch(&data, &token, &message).await {
                        warn!(peer = %token, error = %e, "failed to serve fetch");
                    }
                }
                _ = beat.tick() => self.send_heartbeat().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.say_goodbye().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_scheduler_message(self: Arc<Self>, message: Message) -> Result<(), ClusterError> {
        match message.topic.as_str() {
            topics::SCHEDULER_ASSIGN => match message.decode::<AssignTask>() {
                Ok(assign) => {
                    debug!(worker_id = %self.worker_id, task = %assign.task, callable = %assign.definition.callable, "assigned");
                    tokio::spawn(self.execute(assign));
                }
                Err(e) => warn!(error = %e, "undecodable assignment"),
            },
            topics::SCHEDULER_RELEASE => match message.decode::<ReleaseResults>() {
                Ok(release) => {
                    let dropped = self.store.remove(&release.tasks);
                    debug!(worker_id = %self.worker_id, requested = release.tasks.len(), dropped, "released results");
                }
                Err(e) => warn!(error = %e, "undecodable release"),
            },
            topics::SCHEDULER_EVICT => {
                let reason = message
                    .decode::<WorkerEvicted>()
                    .map(|e| e.reason)
                    .unwrap_or_else(|e| format!("undecodable eviction: {e}"));
                warn!(worker_id = %self.worker_id, reason = %reason, "evicted by scheduler");
                return Err(ClusterError::Evicted(reason));
            }
            other => warn!(topic = other, "unexpected message from scheduler"),
        }
        Ok(())
    }

    async fn execute(self: Arc<Self>, assign: AssignTask) {
        self.executing.fetch_add(1, Ordering::SeqCst);
        let task = assign.task.clone();
        let outcome = self.run_assignment(assign).await;
        self.executing.fetch_sub(1, Ordering::SeqCst);
        if self.halted.load(Ordering::SeqCst) {
            return;
        }

        let worker_id = self.worker_id;
        let sent = match outcome {
            Ok((nbytes, value)) => {
                debug!(worker_id = %worker_id, task = %task, nbytes, "task finished");
                let finished = TaskFinished { worker_id, task: task.clone(), nbytes, value };
                notify(&self.scheduler, topics::WORKER_FINISHED, &finished).await
            }
            Err(failure) => {
                warn!(worker_id = %worker_id, task = %task, failure = ?failure, "task failed");
                let failed = TaskFailed { worker_id, task: task.clone(), failure };
                notify(&self.scheduler, topics::WORKER_FAILED, &failed).await
            }
        };
        if let Err(e) = sent {
            warn!(worker_id = %worker_id, task = %task, error = %e, "could not report task outcome");
        }
    }

    /// Gather inputs, run the callable on the pool and keep the result.
    async fn run_assignment(&self, assign: AssignTask) -> Result<(u64, Option<Value>), TaskFailure> {
        let mut inputs: HashMap<Key, Value> = HashMap::with_capacity(assign.dependencies.len());
        for dep in &assign.dependencies {
            let value = self
                .resolve_dependency(&assign.task, dep)
                .await
                .ok_or_else(|| TaskFailure::MissingDependency { key: dep.key.clone() })?;
            inputs.insert(dep.key.clone(), value);
        }
        let args = assign
            .definition
            .resolve_args(|k| inputs.get(k))
            .map_err(|key| TaskFailure::MissingDependency { key })?;

        let key = assign.task.key.clone();
        let definition = assign.definition;
        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| registry.run_task(&key, &definition, &args)))
                .unwrap_or_else(|payload| {
                    Err(TaskExecutionError::new(key.clone(), format!("panicked: {}", panic_message(&payload))))
                });
            if let Ok(mut m) = metrics.write() {
                match &outcome {
                    Ok(_) => m.record_execution(&definition.callable, start.elapsed()),
                    Err(_) => m.record_failure(),
                }
            }
            let _ = tx.send(outcome);
        });

        let value = rx
            .await
            .map_err(|_| TaskFailure::Execution { message: "task thread exited without a result".into() })?
            .map_err(|e| TaskFailure::Execution { message: e.message })?;
        let nbytes = value.approx_size();
        self.store.insert(assign.task, value.clone(), nbytes);
        Ok((nbytes, assign.report_value.then_some(value)))
    }

    /// Local copy first, then each holder in turn.
    async fn resolve_dependency(&self, task: &TaskRef, dep: &DependencyLocation) -> Option<Value> {
        let dep_ref = TaskRef::new(task.submission, dep.key.clone());
        if let Some(value) = self.store.get(&dep_ref) {
            return Some(value);
        }
        for holder in dep.holders.iter().filter(|h| h.worker_id != self.worker_id) {
            match self.peers.fetch(&holder.address, &dep_ref).await {
                Ok(Some(value)) => {
                    debug!(task = %task, dependency = %dep_ref, from = %holder.worker_id, "fetched dependency");
                    return Some(value);
                }
                Ok(None) => debug!(dependency = %dep_ref, holder = %holder.worker_id, "holder no longer has result"),
                Err(e) => warn!(dependency = %dep_ref, holder = %holder.worker_id, error = %e, "fetch failed"),
            }
        }
        None
    }

    async fn serve_fetch(&self, data: &ZmqRequestServer, token: &ReplyToken, message: &Message) -> Result<(), WireError> {
        if message.topic != topics::PEER_FETCH {
            warn!(peer = %token, topic = %message.topic, "unexpected request on data socket");
            return Ok(());
        }
        let request: FetchResult = message.decode()?;
        let reply = FetchReply { value: self.store.get(&request.task) };
        data.send_reply(token, message.reply(topics::PEER_FETCH_REPLY, &reply)?).await
    }

    async fn send_heartbeat(&self) {
        let beat = WorkerHeartbeat {
            worker_id: self.worker_id,
            executing: self.executing.load(Ordering::SeqCst),
            held: u32::try_from(self.store.len()).unwrap_or(u32::MAX),
            memory_bytes: self.store.memory_bytes(),
        };
        if let Err(e) = notify(&self.scheduler, topics::WORKER_HEARTBEAT, &beat).await {
            warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
        }
    }

    async fn say_goodbye(&self) {
        info!(worker_id = %self.worker_id, "worker shutting down");
        let bye = WorkerGoodbye { worker_id: self.worker_id };
        if let Err(e) = notify(&self.scheduler, topics::WORKER_GOODBYE, &bye).await {
            warn!(worker_id = %self.worker_id, error = %e, "goodbye failed");
        }
        tokio::time::sleep(GOODBYE_GRACE).await;
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
