use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Directory holding named IPC sockets.
pub const IPC_DIR: &str = "/tmp/stellwerk";

/// Where a socket binds or connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket. A bare name lives under [`IPC_DIR`]; an absolute
    /// path is used as is.
    Ipc(String),

    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp { host: host.into(), port }
    }

    /// Parse `tcp://host:port` or `ipc://path`.
    pub fn parse(address: &str) -> Result<Self, WireError> {
        let invalid = || WireError::InvalidAddress(address.to_string());
        if let Some(rest) = address.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            return Ok(Self::tcp(host, port));
        }
        if let Some(path) = address.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Ipc(path.to_string()));
        }
        Err(invalid())
    }

    /// ZeroMQ endpoint string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) if name.starts_with('/') => format!("ipc://{name}"),
            Self::Ipc(name) => format!("ipc://{IPC_DIR}/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    fn ipc_path(&self) -> Option<String> {
        match self {
            Self::Ipc(_) => self.endpoint().strip_prefix("ipc://").map(str::to_string),
            Self::Tcp { .. } => None,
        }
    }

    /// Create the parent directory of an IPC socket. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            if let Some(parent) = Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a socket file left behind by a process that did not clean up.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path, "removed stale IPC socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

impl FromStr for Transport {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
