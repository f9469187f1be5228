use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorKind;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

pub const DEFAULT_SCHEDULER_ADDRESS: &str = "tcp://127.0.0.1:8786";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub executor: ExecutorKind,
    pub local: LocalConfig,
    pub cluster: ClientConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `STELLWERK_PROFILE`. When set (e.g. `CI`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("STELLWERK_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();

        let raw = profiled_env_or(p, "STELLWERK_EXECUTOR", "threads");
        let executor = raw.parse().unwrap_or_else(|e| {
            tracing::warn!(value = %raw, error = %e, "ignoring STELLWERK_EXECUTOR");
            ExecutorKind::Threads
        });

        Self {
            profile: p.to_string(),
            executor,
            local: LocalConfig::from_env_profiled(p),
            cluster: ClientConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  executor:    {}", self.executor);
        tracing::info!(
            "  local:       threads={}, processes={}, keep_warm={}, retries={}",
            self.local.threads,
            self.local.processes,
            self.local.keep_warm,
            self.local.max_retries
        );
        tracing::info!(
            "  proc worker: {}",
            self.local.proc_worker.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(auto)".into())
        );
        tracing::info!(
            "  cluster:     scheduler={}, connect_timeout={}s",
            self.cluster.scheduler_address,
            self.cluster.connect_timeout_secs
        );
    }
}

// ── Local executors ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Thread-pool size (0 = available parallelism).
    pub threads: usize,
    /// Process-pool size (0 = available parallelism).
    pub processes: usize,
    /// Child program for the process pool; defaults to `stellwerk-proc-worker`
    /// next to the running executable.
    pub proc_worker: Option<PathBuf>,
    pub keep_warm: bool,
    /// Retries for a task whose child process died.
    pub max_retries: u32,
}

impl LocalConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            threads: profiled_env_usize(p, "STELLWERK_THREADS", 0),
            processes: profiled_env_usize(p, "STELLWERK_PROCESSES", 0),
            proc_worker: profiled_env_opt(p, "STELLWERK_PROC_WORKER").map(PathBuf::from),
            keep_warm: profiled_env_bool(p, "STELLWERK_KEEP_WARM", false),
            max_retries: profiled_env_u32(p, "STELLWERK_PROCESS_RETRIES", 2),
        }
    }
}

// ── Cluster client ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub scheduler_address: String,
    pub connect_timeout_secs: u64,
}

impl ClientConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            scheduler_address: profiled_env_or(p, "STELLWERK_SCHEDULER", DEFAULT_SCHEDULER_ADDRESS),
            connect_timeout_secs: profiled_env_u64(p, "STELLWERK_TIMEOUT_SECS", 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every test uses its own profile prefix so tests running in parallel
    // never observe each other's variables.

    #[test]
    fn profile_label_reflects_profile() {
        assert_eq!(Config::for_profile("").profile_label(), "default");
        assert_eq!(Config::for_profile("cfgtest_label").profile_label(), "CFGTEST_LABEL");
    }

    #[test]
    fn profiled_keys_take_precedence() {
        env::set_var("CFGTEST_A_STELLWERK_EXECUTOR", "processes");
        env::set_var("CFGTEST_A_STELLWERK_PROCESSES", "3");
        env::set_var("CFGTEST_A_STELLWERK_KEEP_WARM", "yes");
        env::set_var("CFGTEST_A_STELLWERK_SCHEDULER", "tcp://10.0.0.1:9000");

        let config = Config::for_profile("cfgtest_a");
        assert_eq!(config.profile, "CFGTEST_A");
        assert_eq!(config.executor, ExecutorKind::Processes);
        assert_eq!(config.local.processes, 3);
        assert!(config.local.keep_warm);
        assert_eq!(config.cluster.scheduler_address, "tcp://10.0.0.1:9000");
    }

    #[test]
    fn unparseable_executor_falls_back_to_threads() {
        env::set_var("CFGTEST_B_STELLWERK_EXECUTOR", "quantum");
        let config = Config::for_profile("CFGTEST_B");
        assert_eq!(config.executor, ExecutorKind::Threads);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        env::set_var("CFGTEST_C_FLAG", "Off");
        assert!(!profiled_env_bool("CFGTEST_C", "FLAG", true));
        env::set_var("CFGTEST_C_FLAG", "ON");
        assert!(profiled_env_bool("CFGTEST_C", "FLAG", false));
        assert!(profiled_env_bool("CFGTEST_C", "CFGTEST_UNSET_FLAG", true));
    }
}
