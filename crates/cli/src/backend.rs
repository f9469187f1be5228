//! Builds the executor selected on the command line.

use std::sync::Arc;

use stellwerk_cluster::DistributedExecutor;
use stellwerk_core::{Config, ExecError, Executor, ExecutorKind, Registry};
use stellwerk_local::{ProcessConfig, ProcessPoolExecutor, SyncExecutor, ThreadPoolExecutor};
use tracing::info;

/// Apply command-line overrides to the environment-derived config.
pub fn apply_overrides(config: &mut Config, executor: Option<ExecutorKind>, workers: Option<usize>, scheduler: Option<String>) {
    if let Some(kind) = executor {
        config.executor = kind;
    }
    if let Some(n) = workers {
        config.local.threads = n;
        config.local.processes = n;
    }
    if let Some(address) = scheduler {
        config.cluster.scheduler_address = address;
    }
}

/// Create the executor `config.executor` names.
pub fn build_executor(config: &Config) -> Result<Box<dyn Executor>, ExecError> {
    let registry = Arc::new(Registry::builtin());
    let executor: Box<dyn Executor> = match config.executor {
        ExecutorKind::Sync => Box::new(SyncExecutor::new(registry)),
        ExecutorKind::Threads => Box::new(ThreadPoolExecutor::new(registry, config.local.threads)?),
        ExecutorKind::Processes => Box::new(ProcessPoolExecutor::new(ProcessConfig::from_local(&config.local))?),
        ExecutorKind::Distributed => Box::new(DistributedExecutor::from_config(&config.cluster)?),
    };
    info!(executor = executor.name(), "executor ready");
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellwerk_core::{Arg, Graph, Key, Task, Value};

    #[test]
    fn overrides_replace_env_settings() {
        let mut config = Config::for_profile("clitest_overrides");
        apply_overrides(&mut config, Some(ExecutorKind::Processes), Some(3), Some("tcp://10.1.1.1:9000".into()));
        assert_eq!(config.executor, ExecutorKind::Processes);
        assert_eq!(config.local.threads, 3);
        assert_eq!(config.local.processes, 3);
        assert_eq!(config.cluster.scheduler_address, "tcp://10.1.1.1:9000");

        let before = config.clone();
        apply_overrides(&mut config, None, None, None);
        assert_eq!(config.executor, before.executor);
        assert_eq!(config.cluster.scheduler_address, before.cluster.scheduler_address);
    }

    #[test]
    fn local_backends_compute_the_same_value() {
        let graph = Graph::build(vec![
            (Key::from("a"), Task::new("add", vec![Arg::lit(1), Arg::lit(2)])),
            (Key::from("b"), Task::new("mul", vec![Arg::reference("a"), Arg::lit(10)])),
        ])
        .unwrap();
        for kind in [ExecutorKind::Sync, ExecutorKind::Threads] {
            let mut config = Config::for_profile("clitest_backends");
            apply_overrides(&mut config, Some(kind), Some(2), None);
            let executor = build_executor(&config).unwrap();
            assert_eq!(executor.name(), kind.as_str());
            let results = executor.run(&graph, &[Key::from("b")]).unwrap();
            assert_eq!(results[&Key::from("b")], Value::Int(30));
        }
    }

    #[test]
    fn distributed_backend_fails_without_a_scheduler() {
        let mut config = Config::for_profile("clitest_distributed");
        apply_overrides(&mut config, Some(ExecutorKind::Distributed), None, Some("tcp://127.0.0.1:1".into()));
        config.cluster.connect_timeout_secs = 1;
        assert!(matches!(build_executor(&config), Err(ExecError::Transport(_))));
    }
}
