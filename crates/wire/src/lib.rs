//! Messaging layer shared by the stellwerk scheduler, workers and clients.
//!
//! Every frame carries a [`Message`] envelope whose payload is one of the
//! structs in [`protocol`], routed by a topic from [`topics`].

pub mod error;
pub mod message;
pub mod protocol;
pub mod reqrep;
pub mod topics;
pub mod traits;
pub mod transport;

pub use error::WireError;
pub use message::{Message, PROTOCOL_VERSION};
pub use reqrep::{ReplyToken, Undelivered, ZmqRequestClient, ZmqRequestServer};
pub use traits::{call, notify, RequestHandler, RequestSender};
pub use transport::Transport;
