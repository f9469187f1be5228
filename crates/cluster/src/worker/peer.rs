//! Fetching dependency results from the workers that hold them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use stellwerk_core::Value;
use stellwerk_wire::protocol::{FetchReply, FetchResult, TaskRef};
use stellwerk_wire::{call, topics, Transport, WireError, ZmqRequestClient};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// DEALER connections to peer data sockets, one per address. The map is
/// never locked across a connect, so one slow peer does not stall fetches
/// from the others.
#[derive(Default)]
pub struct PeerPool {
    peers: Mutex<HashMap<String, Arc<ZmqRequestClient>>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker at `address` for the result of `task`.
    ///
    /// `Ok(None)` means the peer answered but no longer holds the result.
    pub async fn fetch(&self, address: &str, task: &TaskRef) -> Result<Option<Value>, WireError> {
        let client = self.client(address).await?;
        let request = FetchResult { task: task.clone() };
        match call::<_, _, FetchReply>(&*client, topics::PEER_FETCH, topics::PEER_FETCH_REPLY, &request, FETCH_TIMEOUT)
            .await
        {
            Ok(reply) => Ok(reply.value),
            Err(e) => {
                self.peers.lock().unwrap_or_else(PoisonError::into_inner).remove(address);
                Err(e)
            }
        }
    }

    async fn client(&self, address: &str) -> Result<Arc<ZmqRequestClient>, WireError> {
        if let Some(client) = self.peers.lock().unwrap_or_else(PoisonError::into_inner).get(address) {
            return Ok(Arc::clone(client));
        }
        let transport = Transport::parse(address)?;
        let connected = Arc::new(ZmqRequestClient::connect_within(&transport, CONNECT_TIMEOUT).await?);
        debug!(address, "connected to peer");
        // A concurrent fetch may have connected first; keep that one.
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(peers.entry(address.to_string()).or_insert(connected)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellwerk_core::Key;
    use stellwerk_wire::protocol::SubmissionId;
    use stellwerk_wire::{RequestHandler, ZmqRequestServer};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_peer_does_not_hold_up_the_others() {
        let server = ZmqRequestServer::bind(&Transport::tcp("127.0.0.1", 0)).await.unwrap();
        let address = server.endpoint().to_string();
        tokio::spawn(async move {
            let (token, message) = server.recv_request().await.unwrap();
            let reply = FetchReply { value: Some(Value::Int(5)) };
            server.send_reply(&token, message.reply(topics::PEER_FETCH_REPLY, &reply).unwrap()).await.unwrap();
        });

        let pool = Arc::new(PeerPool::new());
        let task = TaskRef::new(SubmissionId(1), Key::from("a"));
        let unreachable = {
            let pool = Arc::clone(&pool);
            let task = task.clone();
            tokio::spawn(async move { pool.fetch("tcp://127.0.0.1:1", &task).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = tokio::time::timeout(Duration::from_secs(1), pool.fetch(&address, &task)).await.unwrap().unwrap();
        assert_eq!(value, Some(Value::Int(5)));
        assert!(unreachable.await.unwrap().is_err());
    }
}
