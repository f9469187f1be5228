use thiserror::Error;

/// Errors raised by the stellwerk messaging layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid address '{0}' (expected tcp://host:port or ipc://path)")]
    InvalidAddress(String),

    #[error("no reply after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unexpected reply topic '{got}' (expected '{expected}')")]
    UnexpectedReply { expected: String, got: String },
}
