//! Client side of a cluster.
//!
//! [`Client::submit`] sends a graph to the scheduler and returns a
//! [`SubmissionHandle`]. Each target can be awaited through a
//! [`ResultFuture`]. Every handle and future this client holds on the same
//! (submission, key) shares one reference count, and only when the last of
//! them is dropped does the client tell the scheduler it no longer needs the
//! result.
//!
//! One background task owns the connection's inbox. It routes pushed
//! results to waiting futures, forwards releases and heartbeats the
//! scheduler so an idle client is not mistaken for a dead one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use stellwerk_core::{ExecError, Graph, GraphError, Key, Results, Task, Value};
use stellwerk_wire::protocol::{
    Cancel, ClientHello, ClientId, DiagnosticsSnapshot, Gather, Release, RemoteError, ResultFailed, ResultReady,
    Submit, SubmissionId, SubmitReply,
};
use stellwerk_wire::{call, notify, topics, Message, Transport, WireError, ZmqRequestClient};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const GOODBYE_GRACE: Duration = Duration::from_millis(100);

type Outcome = Result<Value, RemoteError>;
type SlotMap = HashMap<(SubmissionId, Key), watch::Sender<Option<Outcome>>>;
type InterestMap = HashMap<(SubmissionId, Key), Weak<KeyInterest>>;

enum ClientEvent {
    Release { submission: SubmissionId, key: Key },
    Goodbye,
}

struct ClientInner {
    id: ClientId,
    address: String,
    scheduler: ZmqRequestClient,
    request_timeout: Duration,
    slots: Mutex<SlotMap>,
    /// The one live interest per key, shared by every handle on it.
    interests: Mutex<InterestMap>,
}

impl ClientInner {
    fn subscribe(&self, submission: SubmissionId, key: &Key) -> watch::Receiver<Option<Outcome>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry((submission, key.clone()))
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn resolve(&self, submission: SubmissionId, key: Key, outcome: Outcome) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry((submission, key)).or_insert_with(|| watch::channel(None).0).send_replace(Some(outcome));
    }

    /// Drop the slot of a key whose last interest went away. Returns false
    /// when a new handle took interest again before the release got here.
    fn retire(&self, submission: SubmissionId, key: &Key) -> bool {
        let id = (submission, key.clone());
        {
            let mut interests = self.interests.lock().unwrap_or_else(PoisonError::into_inner);
            if interests.get(&id).is_some_and(|live| live.strong_count() > 0) {
                return false;
            }
            interests.remove(&id);
        }
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        true
    }
}

/// Connection to a scheduler.
pub struct Client {
    inner: Arc<ClientInner>,
    events: mpsc::UnboundedSender<ClientEvent>,
    pump: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect to the scheduler at `address` (e.g. `tcp://127.0.0.1:8786`).
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, ExecError> {
        let transport = Transport::parse(address).map_err(transport_error)?;
        let scheduler = ZmqRequestClient::connect_within(&transport, timeout)
            .await
            .map_err(|e| ExecError::Transport(format!("scheduler at {address} unreachable: {e}")))?;
        let inbox = scheduler
            .take_inbox()
            .ok_or_else(|| ExecError::Transport("scheduler inbox already taken".into()))?;

        let inner = Arc::new(ClientInner {
            id: ClientId::new(),
            address: address.to_string(),
            scheduler,
            request_timeout: timeout,
            slots: Mutex::new(HashMap::new()),
            interests: Mutex::new(HashMap::new()),
        });
        let (events, events_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(Self::pump(Arc::clone(&inner), inbox, events_rx));
        info!(client = %inner.id, address, "client connected");
        Ok(Self { inner, events, pump: Some(pump) })
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Submit `graph` and ask for `targets`. Graph errors found by the
    /// scheduler (such as a missing target) come back as [`ExecError::Graph`].
    pub async fn submit(&self, graph: &Graph, targets: &[Key]) -> Result<SubmissionHandle, ExecError> {
        let tasks: Vec<(Key, Task)> = graph.iter().map(|(k, t)| (k.clone(), t.clone())).collect();
        let request = Submit { client: self.inner.id, tasks, targets: targets.to_vec() };
        let reply: SubmitReply = call(
            &self.inner.scheduler,
            topics::CLIENT_SUBMIT,
            topics::CLIENT_SUBMIT_REPLY,
            &request,
            self.inner.request_timeout,
        )
        .await
        .map_err(transport_error)?;

        match reply {
            SubmitReply::Accepted { submission } => {
                debug!(client = %self.inner.id, submission = %submission, targets = targets.len(), "submitted");
                Ok(self.handle(submission, targets))
            }
            SubmitReply::Rejected { error } => Err(ExecError::Graph(error)),
        }
    }

    /// Take interest in `keys` of a submission made by any client.
    pub async fn attach(&self, submission: SubmissionId, keys: &[Key]) -> Result<SubmissionHandle, ExecError> {
        let handle = self.handle(submission, keys);
        let request = Gather { client: self.inner.id, submission, keys: keys.to_vec() };
        notify(&self.inner.scheduler, topics::CLIENT_GATHER, &request).await.map_err(transport_error)?;
        Ok(handle)
    }

    /// Scheduler state as of now.
    pub async fn diagnostics(&self) -> Result<DiagnosticsSnapshot, ExecError> {
        let hello = ClientHello { client: self.inner.id };
        call(
            &self.inner.scheduler,
            topics::CLIENT_DIAGNOSTICS,
            topics::CLIENT_DIAGNOSTICS_REPLY,
            &hello,
            self.inner.request_timeout,
        )
        .await
        .map_err(transport_error)
    }

    /// Tell the scheduler this client is gone and stop the background task.
    pub async fn close(mut self) {
        let _ = self.events.send(ClientEvent::Goodbye);
        if let Some(pump) = self.pump.take() {
            let _ = tokio::time::timeout(GOODBYE_GRACE * 5, pump).await;
        }
    }

    fn handle(&self, submission: SubmissionId, keys: &[Key]) -> SubmissionHandle {
        let mut interests: Vec<(Key, Arc<KeyInterest>)> = Vec::with_capacity(keys.len());
        for key in keys {
            if interests.iter().any(|(k, _)| k == key) {
                continue;
            }
            interests.push((key.clone(), self.interest(submission, key)));
        }
        SubmissionHandle {
            id: submission,
            client: self.inner.id,
            inner: Arc::clone(&self.inner),
            interests,
        }
    }

    /// The live interest on `key`, or a new one if every earlier handle is gone.
    fn interest(&self, submission: SubmissionId, key: &Key) -> Arc<KeyInterest> {
        let id = (submission, key.clone());
        let mut interests = self.inner.interests.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(live) = interests.get(&id).and_then(Weak::upgrade) {
            return live;
        }
        let interest = Arc::new(KeyInterest {
            submission,
            key: key.clone(),
            rx: self.inner.subscribe(submission, key),
            events: self.events.clone(),
        });
        interests.insert(id, Arc::downgrade(&interest));
        interest
    }

    async fn pump(
        inner: Arc<ClientInner>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let hello = ClientHello { client: inner.id };
        let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => Self::route(&inner, message),
                    None => {
                        warn!(client = %inner.id, "scheduler connection closed");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(ClientEvent::Release { submission, key }) => {
                        if !inner.retire(submission, &key) {
                            debug!(client = %inner.id, submission = %submission, key = %key, "key taken again, keeping it");
                            continue;
                        }
                        let release = Release { client: inner.id, submission, keys: vec![key] };
                        if let Err(e) = notify(&inner.scheduler, topics::CLIENT_RELEASE, &release).await {
                            warn!(client = %inner.id, error = %e, "release failed");
                        }
                    }
                    Some(ClientEvent::Goodbye) | None => {
                        debug!(client = %inner.id, "saying goodbye");
                        let _ = notify(&inner.scheduler, topics::CLIENT_GOODBYE, &hello).await;
                        tokio::time::sleep(GOODBYE_GRACE).await;
                        break;
                    }
                },
                _ = beat.tick() => {
                    if let Err(e) = notify(&inner.scheduler, topics::CLIENT_HEARTBEAT, &hello).await {
                        warn!(client = %inner.id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    fn route(inner: &ClientInner, message: Message) {
        match message.topic.as_str() {
            topics::SCHEDULER_RESULT => match message.decode::<ResultReady>() {
                Ok(ready) => inner.resolve(ready.submission, ready.key, Ok(ready.value)),
                Err(e) => warn!(error = %e, "undecodable result"),
            },
            topics::SCHEDULER_RESULT_FAILED => match message.decode::<ResultFailed>() {
                Ok(failed) => inner.resolve(failed.submission, failed.key, Err(failed.error)),
                Err(e) => warn!(error = %e, "undecodable failure"),
            },
            other => warn!(topic = other, "unexpected push from scheduler"),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.events.send(ClientEvent::Goodbye);
    }
}

/// Keeps the scheduler holding one key's result for this client. Dropped
/// with the last handle or future on the key.
struct KeyInterest {
    submission: SubmissionId,
    key: Key,
    rx: watch::Receiver<Option<Outcome>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Drop for KeyInterest {
    fn drop(&mut self) {
        let _ = self.events.send(ClientEvent::Release { submission: self.submission, key: self.key.clone() });
    }
}

/// A submitted graph, seen from one client.
pub struct SubmissionHandle {
    id: SubmissionId,
    client: ClientId,
    inner: Arc<ClientInner>,
    interests: Vec<(Key, Arc<KeyInterest>)>,
}

impl SubmissionHandle {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Distinct target keys, in request order.
    pub fn targets(&self) -> impl Iterator<Item = &Key> {
        self.interests.iter().map(|(k, _)| k)
    }

    /// A future for one target. Fails with `MissingKey` for keys that were
    /// not requested.
    pub fn future(&self, key: &Key) -> Result<ResultFuture, ExecError> {
        self.interests
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, interest)| ResultFuture { interest: Arc::clone(interest) })
            .ok_or_else(|| ExecError::Graph(GraphError::MissingKey { task: None, missing: key.clone() }))
    }

    /// Wait for every target; the first failure wins.
    pub async fn gather(&self) -> Result<Results, ExecError> {
        let mut results = Results::with_capacity(self.interests.len());
        for (key, interest) in &self.interests {
            let value = wait_for(interest).await?;
            results.insert(key.clone(), value);
        }
        Ok(results)
    }

    /// Stop the submission. Pending futures resolve to [`ExecError::Cancelled`].
    pub async fn cancel(&self) -> Result<(), ExecError> {
        let request = Cancel { client: self.client, submission: self.id };
        notify(&self.inner.scheduler, topics::CLIENT_CANCEL, &request).await.map_err(transport_error)
    }
}

impl fmt::Debug for SubmissionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionHandle")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("targets", &self.targets().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared, cloneable handle on one target's result.
#[derive(Clone)]
pub struct ResultFuture {
    interest: Arc<KeyInterest>,
}

impl ResultFuture {
    pub fn key(&self) -> &Key {
        &self.interest.key
    }

    pub fn is_ready(&self) -> bool {
        self.interest.rx.borrow().is_some()
    }

    /// Wait for the value.
    pub async fn wait(&self) -> Result<Value, ExecError> {
        wait_for(&self.interest).await
    }

    /// Live handles and futures on this key across the client, this one
    /// included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.interest)
    }
}

impl fmt::Debug for ResultFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFuture")
            .field("submission", &self.interest.submission)
            .field("key", &self.interest.key)
            .field("ready", &self.is_ready())
            .finish()
    }
}

async fn wait_for(interest: &KeyInterest) -> Result<Value, ExecError> {
    let mut rx = interest.rx.clone();
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| ExecError::Transport(format!("client closed before '{}' arrived", interest.key)))?;
    match &*outcome {
        Some(Ok(value)) => Ok(value.clone()),
        Some(Err(e)) => Err(ExecError::from(e.clone())),
        None => Err(ExecError::Transport(format!("no outcome for '{}'", interest.key))),
    }
}

fn transport_error(e: WireError) -> ExecError {
    ExecError::Transport(e.to_string())
}
