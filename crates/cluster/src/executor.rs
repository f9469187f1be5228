use std::time::Duration;

use stellwerk_core::config::ClientConfig;
use stellwerk_core::{ExecError, Executor, Graph, Key, Results};
use tokio::runtime::Runtime;

use crate::client::Client;

/// Runs graphs on a cluster through a [`Client`] driven by its own tokio
/// runtime, so it can be used from blocking code. Must not be created or
/// dropped inside another tokio runtime.
pub struct DistributedExecutor {
    // Dropped before the runtime it was connected on.
    client: Client,
    runtime: Runtime,
}

impl DistributedExecutor {
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, ExecError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stellwerk-client")
            .enable_all()
            .build()?;
        let client = runtime.block_on(Client::connect(address, timeout))?;
        Ok(Self { client, runtime })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ExecError> {
        Self::connect(&config.scheduler_address, Duration::from_secs(config.connect_timeout_secs))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Executor for DistributedExecutor {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn run(&self, graph: &Graph, targets: &[Key]) -> Result<Results, ExecError> {
        self.runtime.block_on(async {
            let submission = self.client.submit(graph, targets).await?;
            submission.gather().await
        })
    }
}
