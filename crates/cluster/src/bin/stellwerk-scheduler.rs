//! stellwerk-scheduler: central scheduler of a stellwerk cluster.
//!
//! Workers and clients connect to its ROUTER socket. Exits non-zero when the
//! bind address is unusable or already taken.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: tcp://0.0.0.0:8786, no dashboard
//! stellwerk-scheduler
//!
//! # Custom port, faster failure detection, JSON diagnostics on :8787
//! stellwerk-scheduler --bind-address tcp://0.0.0.0:9786 --heartbeat-timeout-ms 2000 --dashboard-port 8787
//!
//! # From a file, with environment overrides
//! STELLWERK_SCHEDULER_MAX_RETRIES=5 stellwerk-scheduler --config stellwerk.toml
//! ```

use clap::Parser;
use stellwerk_cluster::signal::shutdown_signal;
use stellwerk_cluster::{ClusterConfig, SchedulerServer};

/// Central scheduler of a stellwerk cluster.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-scheduler", version, about)]
struct Cli {
    /// Address to bind, e.g. `tcp://0.0.0.0:8786`.
    #[arg(long)]
    bind_address: Option<String>,

    /// TOML configuration file; `[scheduler]` is read.
    #[arg(long, env = "STELLWERK_CONFIG")]
    config: Option<String>,

    /// A worker silent for this long is considered lost.
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Worker losses a task may suffer before its submission fails.
    #[arg(long)]
    max_retries: Option<u32>,

    /// HTTP port for `GET /diagnostics` (0 = disabled).
    #[arg(long)]
    dashboard_port: Option<u16>,
}

impl Cli {
    fn into_config(self) -> Result<ClusterConfig, stellwerk_cluster::ClusterError> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::from_file(path)?,
            None => ClusterConfig::from_env()?,
        };
        let s = &mut config.scheduler;
        if let Some(addr) = self.bind_address {
            s.bind_address = addr;
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            s.heartbeat_timeout_ms = ms;
        }
        if let Some(n) = self.max_retries {
            s.max_retries = n;
        }
        match self.dashboard_port {
            Some(0) => s.dashboard_port = None,
            Some(port) => s.dashboard_port = Some(port),
            None => {}
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stellwerk_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting stellwerk-scheduler");

    let config = cli.into_config()?;
    let handle = SchedulerServer::new(config.scheduler).start().await?;
    tracing::info!(endpoint = %handle.endpoint(), "scheduler ready");

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    handle.shutdown();
    handle.join().await;

    tracing::info!("stellwerk-scheduler exited");
    Ok(())
}
