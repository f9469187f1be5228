use thiserror::Error;

use stellwerk_wire::WireError;

/// Errors raised while standing up or talking to a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("scheduler at {address} unreachable: {reason}")]
    SchedulerUnreachable { address: String, reason: String },

    #[error("evicted by scheduler: {0}")]
    Evicted(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}
