//! DEALER/ROUTER messaging with correlation-id matched replies.
//!
//! - [`ZmqRequestClient`] wraps a DEALER socket. Replies are matched to
//!   pending requests by `correlation_id`; anything else is a push from the
//!   peer and lands in the client's inbox.
//! - [`ZmqRequestServer`] wraps a ROUTER socket. Every inbound message comes
//!   with a [`ReplyToken`] that can be used any number of times, so the
//!   server can push to a peer long after its last request.
//!
//! Both sockets are owned by a background task that multiplexes sends and
//! receives with `tokio::select!`. A pending receive is rebuilt at least
//! every [`RECV_REARM`], so inbound frames are never parked behind a quiet
//! outbound side.
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! - DEALER sends and receives `[topic, envelope]`
//! - ROUTER receives and sends `[identity, topic, envelope]`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::error::WireError;
use crate::message::{Message, PROTOCOL_VERSION};
use crate::traits::{RequestHandler, RequestSender};
use crate::transport::Transport;

/// Longest a receive stays armed before the event loop rebuilds it.
pub const RECV_REARM: Duration = Duration::from_millis(50);

fn rearm_interval() -> tokio::time::Interval {
    let mut rearm = tokio::time::interval(RECV_REARM);
    rearm.set_missed_tick_behavior(MissedTickBehavior::Skip);
    rearm
}

/// Routing identity of a peer connected to a [`ZmqRequestServer`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyToken {
    identity: Vec<u8>,
}

impl fmt::Display for ReplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.identity.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Split `[.., topic, envelope]` frames, skipping empty delimiters.
fn decode_envelope<'a>(frames: impl Iterator<Item = &'a [u8]>) -> Result<Message, WireError> {
    let data: Vec<&[u8]> = frames.skip_while(|f| f.is_empty()).collect();
    if data.len() < 2 {
        return Err(WireError::Transport(format!("expected [topic, envelope], got {} frames", data.len())));
    }
    let message = Message::from_bytes(data[1])?;
    if message.version > PROTOCOL_VERSION {
        return Err(WireError::Transport(format!(
            "peer speaks protocol v{}, this build speaks v{PROTOCOL_VERSION}",
            message.version
        )));
    }
    Ok(message)
}

struct SendCommand {
    zmq_msg: ZmqMessage,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>;

/// DEALER-socket client.
pub struct ZmqRequestClient {
    send_tx: mpsc::Sender<SendCommand>,
    pending: PendingMap,
    inbox: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestClient {
    /// Connect a DEALER socket. zeromq keeps retrying an unreachable
    /// endpoint, so callers that need a deadline use [`Self::connect_within`].
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, WireError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting DEALER socket");
        socket.connect(&endpoint).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (send_tx, send_rx) = mpsc::channel::<SendCommand>(256);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let loop_pending = Arc::clone(&pending);
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, loop_pending, inbox_tx).await;
        });

        Ok(Self { send_tx, pending, inbox: std::sync::Mutex::new(Some(inbox_rx)), loop_handle })
    }

    pub async fn connect_within(transport: &Transport, timeout: Duration) -> Result<Self, WireError> {
        tokio::time::timeout(timeout, Self::connect(transport))
            .await
            .map_err(|_| WireError::Timeout(timeout))?
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<SendCommand>,
        pending: PendingMap,
        inbox: mpsc::UnboundedSender<Message>,
    ) {
        let mut rearm = rearm_interval();
        loop {
            tokio::select! {
                Some(cmd) = send_rx.recv() => {
                    if let Err(e) = socket.send(cmd.zmq_msg).await {
                        warn!(error = %e, "DEALER send failed");
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => Self::dispatch(&pending, &inbox, zmq_msg).await,
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                _ = rearm.tick() => {}
            }
        }
    }

    async fn dispatch(
        pending: &Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
        inbox: &mpsc::UnboundedSender<Message>,
        zmq_msg: ZmqMessage,
    ) {
        let message = match decode_envelope(zmq_msg.iter().map(|f| f.as_ref())) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        let waiter = pending.lock().await.remove(&message.correlation_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                if inbox.send(message).is_err() {
                    debug!("inbox closed, dropping push");
                }
            }
        }
    }

    /// Take the receiver for messages the peer pushed unprompted.
    ///
    /// Returns `None` after the first call. The receiver yields `None` once
    /// the connection's event loop has stopped.
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbox.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn enqueue_send(&self, msg: &Message) -> Result<(), WireError> {
        let mut zmq_msg = ZmqMessage::from(msg.topic.as_str());
        zmq_msg.push_back(msg.to_bytes()?.into());
        self.send_tx
            .send(SendCommand { zmq_msg })
            .await
            .map_err(|_| WireError::Transport("client event loop closed".into()))
    }
}

impl Drop for ZmqRequestClient {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

#[async_trait]
impl RequestSender for ZmqRequestClient {
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, WireError> {
        let cid = msg.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(cid, tx);

        if let Err(e) = self.enqueue_send(&msg).await {
            self.pending.lock().await.remove(&cid);
            return Err(e);
        }
        debug!(correlation_id = %cid, topic = %msg.topic, "sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&cid);
                Err(WireError::Transport("reply channel closed unexpectedly".into()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&cid);
                Err(WireError::Timeout(timeout))
            }
        }
    }

    async fn notify(&self, msg: Message) -> Result<(), WireError> {
        self.enqueue_send(&msg).await?;
        debug!(topic = %msg.topic, "sent notification");
        Ok(())
    }
}

struct Outbound {
    zmq_msg: ZmqMessage,
    report: Report,
}

/// Where the outcome of a ROUTER send goes.
enum Report {
    /// A [`RequestHandler::send_reply`] caller is waiting on it.
    Caller(oneshot::Sender<Result<(), WireError>>),
    /// Queued with [`ZmqRequestServer::post`]; only failures are reported.
    Posted { token: ReplyToken, message: Message },
}

/// A posted message the ROUTER socket refused, usually because the peer is
/// gone.
#[derive(Debug, Clone)]
pub struct Undelivered {
    pub token: ReplyToken,
    pub message: Message,
    pub reason: String,
}

/// ROUTER-socket server.
pub struct ZmqRequestServer {
    inbound: Mutex<mpsc::UnboundedReceiver<(ReplyToken, Message)>>,
    send_tx: mpsc::UnboundedSender<Outbound>,
    undelivered: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Undelivered>>>,
    endpoint: String,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestServer {
    /// Bind a ROUTER socket. Binding TCP port 0 picks a free port; see
    /// [`Self::endpoint`] for the address actually bound.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, WireError> {
        transport.ensure_ipc_dir().map_err(|e| WireError::Transport(e.to_string()))?;
        transport.remove_stale_socket().map_err(|e| WireError::Transport(e.to_string()))?;

        let mut socket = RouterSocket::new();
        let bound = socket.bind(&transport.endpoint()).await?;
        let endpoint = bound.to_string();
        info!(endpoint = %endpoint, "bound ROUTER socket");

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel::<Outbound>();
        let (undelivered_tx, undelivered_rx) = mpsc::unbounded_channel();
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, in_tx, undelivered_tx).await;
        });

        Ok(Self {
            inbound: Mutex::new(in_rx),
            send_tx,
            undelivered: std::sync::Mutex::new(Some(undelivered_rx)),
            endpoint,
            loop_handle,
        })
    }

    /// Resolved endpoint, e.g. `tcp://127.0.0.1:40123`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue `message` for the peer behind `token` and return at once.
    ///
    /// Only a closed event loop fails here. Frames the socket later refuses
    /// are reported through [`Self::take_undelivered`].
    pub fn post(&self, token: &ReplyToken, message: Message) -> Result<(), WireError> {
        let zmq_msg = routed(token, &message)?;
        debug!(peer = %token, correlation_id = %message.correlation_id, topic = %message.topic, "posted");
        let report = Report::Posted { token: token.clone(), message };
        self.send_tx
            .send(Outbound { zmq_msg, report })
            .map_err(|_| WireError::Transport("server event loop closed".into()))
    }

    /// Take the receiver for posted messages that could not be sent.
    ///
    /// Returns `None` after the first call.
    pub fn take_undelivered(&self) -> Option<mpsc::UnboundedReceiver<Undelivered>> {
        self.undelivered.lock().ok().and_then(|mut slot| slot.take())
    }

    /// The next request if one has already arrived.
    pub fn try_recv_request(&self) -> Option<(ReplyToken, Message)> {
        let (token, message) = self.inbound.try_lock().ok()?.try_recv().ok()?;
        debug!(peer = %token, correlation_id = %message.correlation_id, topic = %message.topic, "received");
        Some((token, message))
    }

    async fn event_loop(
        mut socket: RouterSocket,
        mut send_rx: mpsc::UnboundedReceiver<Outbound>,
        inbound: mpsc::UnboundedSender<(ReplyToken, Message)>,
        undelivered: mpsc::UnboundedSender<Undelivered>,
    ) {
        let mut rearm = rearm_interval();
        loop {
            tokio::select! {
                Some(out) = send_rx.recv() => {
                    let result = socket.send(out.zmq_msg).await;
                    match out.report {
                        Report::Caller(done) => {
                            let _ = done.send(result.map_err(WireError::from));
                        }
                        Report::Posted { token, message } => {
                            if let Err(e) = result {
                                debug!(peer = %token, topic = %message.topic, error = %e, "posted message undeliverable");
                                let _ = undelivered.send(Undelivered { token, message, reason: e.to_string() });
                            }
                        }
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => match Self::split(zmq_msg) {
                            Ok(pair) => {
                                if inbound.send(pair).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed request"),
                        },
                        Err(e) => {
                            debug!(error = %e, "ROUTER recv loop ending");
                            break;
                        }
                    }
                }
                _ = rearm.tick() => {}
            }
        }
    }

    fn split(zmq_msg: ZmqMessage) -> Result<(ReplyToken, Message), WireError> {
        let mut frames = zmq_msg.iter().map(|f| f.as_ref());
        let identity = frames
            .next()
            .ok_or_else(|| WireError::Transport("ROUTER message without identity".into()))?
            .to_vec();
        let message = decode_envelope(frames)?;
        Ok((ReplyToken { identity }, message))
    }
}

/// `[identity, topic, envelope]` for a ROUTER send.
fn routed(token: &ReplyToken, message: &Message) -> Result<ZmqMessage, WireError> {
    let mut zmq_msg = ZmqMessage::from(token.identity.clone());
    zmq_msg.push_back(message.topic.as_bytes().to_vec().into());
    zmq_msg.push_back(message.to_bytes()?.into());
    Ok(zmq_msg)
}

impl Drop for ZmqRequestServer {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

#[async_trait]
impl RequestHandler for ZmqRequestServer {
    async fn recv_request(&self) -> Result<(ReplyToken, Message), WireError> {
        let (token, message) = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| WireError::Transport("server event loop closed".into()))?;
        debug!(peer = %token, correlation_id = %message.correlation_id, topic = %message.topic, "received");
        Ok((token, message))
    }

    async fn send_reply(&self, token: &ReplyToken, reply: Message) -> Result<(), WireError> {
        let zmq_msg = routed(token, &reply)?;
        let (done, done_rx) = oneshot::channel();
        self.send_tx
            .send(Outbound { zmq_msg, report: Report::Caller(done) })
            .map_err(|_| WireError::Transport("server event loop closed".into()))?;
        done_rx.await.map_err(|_| WireError::Transport("server event loop closed".into()))??;

        debug!(peer = %token, correlation_id = %reply.correlation_id, topic = %reply.topic, "sent");
        Ok(())
    }
}
