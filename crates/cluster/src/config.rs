//! Cluster configuration, parsed from `stellwerk.toml`.
//!
//! ```toml
//! [scheduler]
//! bind_address = "tcp://0.0.0.0:8786"
//! heartbeat_interval_ms = 500
//! heartbeat_timeout_ms = 5000
//! max_retries = 3
//! dashboard_port = 8787
//!
//! [worker]
//! threads = 4
//! listen_host = "10.0.0.7"
//! ```
//!
//! `STELLWERK_SCHEDULER_<KEY>` and `STELLWERK_WORKER_<KEY>` environment
//! variables override the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stellwerk_core::config::DEFAULT_SCHEDULER_ADDRESS;
use stellwerk_wire::Transport;

use crate::error::ClusterError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// How often workers and clients heartbeat, and how often the scheduler
    /// checks for missed heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A worker silent for this long is considered lost.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// A client silent for this long is considered gone.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,

    /// Worker losses a single task may suffer before its submission fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Port for `GET /diagnostics`; disabled when unset.
    pub dashboard_port: Option<u16>,
}

fn default_bind_address() -> String {
    "tcp://0.0.0.0:8786".into()
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_client_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            client_timeout_ms: default_client_timeout_ms(),
            max_retries: default_max_retries(),
            dashboard_port: None,
        }
    }
}

impl SchedulerSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_scheduler_address")]
    pub scheduler_address: String,

    /// Threads per worker process (0 = available parallelism).
    #[serde(default)]
    pub threads: usize,

    /// Worker processes to run on this host.
    #[serde(default = "default_process_count")]
    pub process_count: u32,

    /// Host advertised to peers for result fetches.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Port of the data socket (0 = any free port).
    #[serde(default)]
    pub listen_port: u16,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Restarts a supervised worker process gets after crashing or being
    /// evicted.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    pub name: Option<String>,
}

fn default_scheduler_address() -> String {
    DEFAULT_SCHEDULER_ADDRESS.into()
}

fn default_process_count() -> u32 {
    1
}

fn default_listen_host() -> String {
    "127.0.0.1".into()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_max_restarts() -> u32 {
    3
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            scheduler_address: default_scheduler_address(),
            threads: 0,
            process_count: default_process_count(),
            listen_host: default_listen_host(),
            listen_port: 0,
            startup_timeout_secs: default_startup_timeout_secs(),
            max_restarts: default_max_restarts(),
            name: None,
        }
    }
}

impl WorkerSection {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

impl ClusterConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, ClusterError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for runs without a file.
    pub fn from_env() -> Result<Self, ClusterError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `STELLWERK_<SECTION>_<KEY>` overrides. Unparseable numbers are
    /// ignored with a warning.
    pub(crate) fn apply_env_overrides(&mut self) {
        let s = &mut self.scheduler;
        if let Ok(v) = std::env::var("STELLWERK_SCHEDULER_BIND_ADDRESS") {
            s.bind_address = v;
        }
        override_parsed("STELLWERK_SCHEDULER_HEARTBEAT_INTERVAL_MS", &mut s.heartbeat_interval_ms);
        override_parsed("STELLWERK_SCHEDULER_HEARTBEAT_TIMEOUT_MS", &mut s.heartbeat_timeout_ms);
        override_parsed("STELLWERK_SCHEDULER_CLIENT_TIMEOUT_MS", &mut s.client_timeout_ms);
        override_parsed("STELLWERK_SCHEDULER_MAX_RETRIES", &mut s.max_retries);
        if let Ok(v) = std::env::var("STELLWERK_SCHEDULER_DASHBOARD_PORT") {
            match v.parse::<u16>() {
                Ok(0) => s.dashboard_port = None,
                Ok(port) => s.dashboard_port = Some(port),
                Err(_) => tracing::warn!(value = %v, "ignoring STELLWERK_SCHEDULER_DASHBOARD_PORT"),
            }
        }

        let w = &mut self.worker;
        if let Ok(v) = std::env::var("STELLWERK_WORKER_SCHEDULER_ADDRESS") {
            w.scheduler_address = v;
        }
        override_parsed("STELLWERK_WORKER_THREADS", &mut w.threads);
        override_parsed("STELLWERK_WORKER_PROCESS_COUNT", &mut w.process_count);
        if let Ok(v) = std::env::var("STELLWERK_WORKER_LISTEN_HOST") {
            w.listen_host = v;
        }
        override_parsed("STELLWERK_WORKER_LISTEN_PORT", &mut w.listen_port);
        override_parsed("STELLWERK_WORKER_STARTUP_TIMEOUT_SECS", &mut w.startup_timeout_secs);
        override_parsed("STELLWERK_WORKER_MAX_RESTARTS", &mut w.max_restarts);
        if let Ok(v) = std::env::var("STELLWERK_WORKER_NAME") {
            w.name = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        Transport::parse(&self.scheduler.bind_address)
            .map_err(|e| ClusterError::Config(format!("scheduler.bind_address: {e}")))?;
        Transport::parse(&self.worker.scheduler_address)
            .map_err(|e| ClusterError::Config(format!("worker.scheduler_address: {e}")))?;

        let s = &self.scheduler;
        if s.heartbeat_interval_ms == 0 {
            return Err(ClusterError::Config("scheduler.heartbeat_interval_ms must be positive".into()));
        }
        if s.heartbeat_timeout_ms <= s.heartbeat_interval_ms {
            return Err(ClusterError::Config(format!(
                "scheduler.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                s.heartbeat_timeout_ms, s.heartbeat_interval_ms
            )));
        }
        if s.client_timeout_ms <= s.heartbeat_interval_ms {
            return Err(ClusterError::Config(format!(
                "scheduler.client_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                s.client_timeout_ms, s.heartbeat_interval_ms
            )));
        }
        if self.worker.process_count == 0 {
            return Err(ClusterError::Config("worker.process_count must be at least 1".into()));
        }
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(var) {
        match v.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value = %v, "ignoring unparseable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = ClusterConfig::from_toml("").unwrap();
        assert_eq!(cfg.scheduler.max_retries, 3);
        assert_eq!(cfg.scheduler.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(cfg.worker.process_count, 1);
        assert_eq!(cfg.worker.max_restarts, 3);
        assert_eq!(cfg.worker.scheduler_address, DEFAULT_SCHEDULER_ADDRESS);
        assert!(cfg.scheduler.dashboard_port.is_none());
    }

    #[test]
    fn parses_both_sections() {
        let toml = r#"
[scheduler]
bind_address = "tcp://127.0.0.1:9786"
heartbeat_interval_ms = 100
heartbeat_timeout_ms = 1000
max_retries = 5
dashboard_port = 9787

[worker]
scheduler_address = "tcp://10.1.1.1:9786"
threads = 2
process_count = 3
max_restarts = 0
name = "gpu-box"
"#;
        let cfg = ClusterConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.scheduler.bind_address, "tcp://127.0.0.1:9786");
        assert_eq!(cfg.scheduler.heartbeat_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.scheduler.max_retries, 5);
        assert_eq!(cfg.scheduler.dashboard_port, Some(9787));
        assert_eq!(cfg.worker.threads, 2);
        assert_eq!(cfg.worker.process_count, 3);
        assert_eq!(cfg.worker.max_restarts, 0);
        assert_eq!(cfg.worker.name.as_deref(), Some("gpu-box"));
        assert_eq!(cfg.worker.listen_host, "127.0.0.1");
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let toml = "[scheduler]\nheartbeat_interval_ms = 1000\nheartbeat_timeout_ms = 1000\n";
        let err = ClusterConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ClusterError::Config(ref m) if m.contains("heartbeat_timeout_ms")));
    }

    #[test]
    fn bad_addresses_are_rejected() {
        let err = ClusterConfig::from_toml("[scheduler]\nbind_address = \"0.0.0.0:8786\"\n").unwrap_err();
        assert!(matches!(err, ClusterError::Config(ref m) if m.contains("bind_address")));
    }

    #[test]
    fn zero_processes_is_invalid() {
        assert!(ClusterConfig::from_toml("[worker]\nprocess_count = 0\n").is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(ClusterConfig::from_toml("[scheduler"), Err(ClusterError::ConfigParse(_))));
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stellwerk.toml");
        std::fs::write(&path, "[scheduler]\nmax_retries = 7\n").unwrap();
        assert_eq!(ClusterConfig::from_file(&path).unwrap().scheduler.max_retries, 7);
        assert!(matches!(
            ClusterConfig::from_file(dir.path().join("absent.toml")),
            Err(ClusterError::ConfigIo(_))
        ));
    }
}
