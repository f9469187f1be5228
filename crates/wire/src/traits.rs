use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WireError;
use crate::message::Message;
use crate::reqrep::ReplyToken;

/// Sends requests to a single peer and matches replies by correlation id.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send `msg` and wait up to `timeout` for its reply.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, WireError>;

    /// Send `msg` without waiting for anything back.
    async fn notify(&self, msg: Message) -> Result<(), WireError>;
}

#[async_trait]
impl<T: RequestSender + ?Sized> RequestSender for Arc<T> {
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, WireError> {
        (**self).request(msg, timeout).await
    }

    async fn notify(&self, msg: Message) -> Result<(), WireError> {
        (**self).notify(msg).await
    }
}

/// Receives messages from many peers and routes replies back to them.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn recv_request(&self) -> Result<(ReplyToken, Message), WireError>;

    /// Send `reply` to the peer behind `token`. Fails if the peer is gone.
    async fn send_reply(&self, token: &ReplyToken, reply: Message) -> Result<(), WireError>;
}

#[async_trait]
impl<T: RequestHandler + ?Sized> RequestHandler for Arc<T> {
    async fn recv_request(&self) -> Result<(ReplyToken, Message), WireError> {
        (**self).recv_request().await
    }

    async fn send_reply(&self, token: &ReplyToken, reply: Message) -> Result<(), WireError> {
        (**self).send_reply(token, reply).await
    }
}

/// Typed request: encode `payload` on `topic`, expect `reply_topic` back.
pub async fn call<S, Req, Resp>(
    sender: &S,
    topic: &str,
    reply_topic: &str,
    payload: &Req,
    timeout: Duration,
) -> Result<Resp, WireError>
where
    S: RequestSender + ?Sized,
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let reply = sender.request(Message::new(topic, payload)?, timeout).await?;
    if reply.topic != reply_topic {
        return Err(WireError::UnexpectedReply { expected: reply_topic.to_string(), got: reply.topic });
    }
    Ok(reply.decode()?)
}

/// Typed fire-and-forget.
pub async fn notify<S, T>(sender: &S, topic: &str, payload: &T) -> Result<(), WireError>
where
    S: RequestSender + ?Sized,
    T: Serialize + Sync,
{
    sender.notify(Message::new(topic, payload)?).await
}
