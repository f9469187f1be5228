use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stellwerk_core::config::LocalConfig;

/// Resolve a pool size (0 means use available parallelism).
pub fn resolve_pool_size(requested: usize) -> usize {
    if requested == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        requested
    }
}

/// Process-pool configuration, typically derived from [`LocalConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program run for each child; must speak the stdio frame protocol.
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Number of children. 0 = available parallelism.
    #[serde(default)]
    pub workers: usize,
    /// Retries for a task whose child died mid-task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keep children alive between runs.
    #[serde(default)]
    pub keep_warm: bool,
}

fn default_max_retries() -> u32 { 2 }

pub const PROC_WORKER_BIN: &str = "stellwerk-proc-worker";

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workers: 0,
            max_retries: default_max_retries(),
            keep_warm: false,
        }
    }

    /// Build from environment-derived settings, locating the default child
    /// program when none is configured.
    pub fn from_local(local: &LocalConfig) -> Self {
        let program = local.proc_worker.clone().unwrap_or_else(default_program);
        Self {
            program,
            args: Vec::new(),
            workers: local.processes,
            max_retries: local.max_retries,
            keep_warm: local.keep_warm,
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn keep_warm(mut self, keep: bool) -> Self {
        self.keep_warm = keep;
        self
    }

    pub fn resolved_workers(&self) -> usize {
        resolve_pool_size(self.workers)
    }
}

/// `stellwerk-proc-worker` next to the running executable, or one directory
/// up (where cargo places binaries relative to test executables). Falls back
/// to a `PATH` lookup.
pub fn default_program() -> PathBuf {
    let name = format!("{PROC_WORKER_BIN}{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(d) = dir else { break };
            let candidate = d.join(&name);
            if candidate.is_file() {
                return candidate;
            }
            dir = d.parent();
        }
    }
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_resolves_to_parallelism() {
        assert!(resolve_pool_size(0) >= 1);
        assert_eq!(resolve_pool_size(3), 3);
    }

    #[test]
    fn config_defaults_from_toml_like_input() {
        let config: ProcessConfig = serde_json::from_str(r#"{"program": "/bin/worker"}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert!(!config.keep_warm);
        assert!(config.args.is_empty());
    }

    #[test]
    fn builder_overrides() {
        let config = ProcessConfig::new("w").workers(2).max_retries(0).keep_warm(true);
        assert_eq!(config.resolved_workers(), 2);
        assert_eq!(config.max_retries, 0);
        assert!(config.keep_warm);
    }
}
