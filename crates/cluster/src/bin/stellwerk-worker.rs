//! stellwerk-worker: executes tasks for a stellwerk scheduler.
//!
//! With `--process-count N` (N > 1) it supervises N single-process workers,
//! prefixing their output with each worker's name. A worker that crashes or
//! is evicted is restarted up to `--max-restarts` times; one that cannot
//! reach the scheduler stops the group.
//!
//! The exit code tells why the worker ended: 0 after a clean stop, 3 when
//! the scheduler was unreachable, 4 after eviction, 1 otherwise.
//!
//! # Usage
//!
//! ```bash
//! # One process, one thread per core
//! stellwerk-worker tcp://10.0.0.1:8786
//!
//! # Four processes with two threads each, reachable by peers on 10.0.0.7
//! stellwerk-worker tcp://10.0.0.1:8786 --process-count 4 --threads-per-process 2 --listen 10.0.0.7
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use stellwerk_cluster::signal::shutdown_signal;
use stellwerk_cluster::supervisor::group_exit_code;
use stellwerk_cluster::{ClusterConfig, ExitReason, Supervisor, Worker, WorkerCommand, WorkerHandle, WorkerSection};
use stellwerk_core::Registry;

/// Executes tasks for a stellwerk scheduler.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-worker", version, about)]
struct Cli {
    /// Scheduler address, e.g. `tcp://127.0.0.1:8786`.
    scheduler_address: Option<String>,

    /// TOML configuration file; `[worker]` is read.
    #[arg(long, env = "STELLWERK_CONFIG")]
    config: Option<String>,

    /// Worker processes to run on this host.
    #[arg(long)]
    process_count: Option<u32>,

    /// Task threads per process (0 = available parallelism).
    #[arg(long)]
    threads_per_process: Option<usize>,

    /// `HOST` or `HOST:PORT` for the peer data socket.
    #[arg(long)]
    listen: Option<String>,

    /// Give up when the scheduler does not answer within this many seconds.
    #[arg(long)]
    startup_timeout_secs: Option<u64>,

    /// Restarts per supervised process after a crash or eviction.
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Name reported to the scheduler.
    #[arg(long)]
    name: Option<String>,
}

impl Cli {
    fn into_section(self) -> anyhow::Result<WorkerSection> {
        let config = match &self.config {
            Some(path) => ClusterConfig::from_file(path)?,
            None => ClusterConfig::from_env()?,
        };
        let mut w = config.worker;
        if let Some(addr) = self.scheduler_address {
            w.scheduler_address = addr;
        }
        if let Some(n) = self.process_count {
            w.process_count = n;
        }
        if let Some(t) = self.threads_per_process {
            w.threads = t;
        }
        if let Some(listen) = self.listen {
            let (host, port) = parse_listen(&listen)?;
            w.listen_host = host;
            w.listen_port = port;
        }
        if let Some(secs) = self.startup_timeout_secs {
            w.startup_timeout_secs = secs;
        }
        if let Some(n) = self.max_restarts {
            w.max_restarts = n;
        }
        if self.name.is_some() {
            w.name = self.name;
        }
        if w.process_count == 0 {
            anyhow::bail!("--process-count must be at least 1");
        }
        Ok(w)
    }
}

fn parse_listen(listen: &str) -> anyhow::Result<(String, u16)> {
    match listen.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), port.parse()?)),
        Some(_) => anyhow::bail!("--listen needs a host, got '{listen}'"),
        None => Ok((listen.to_string(), 0)),
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
    tracing::info!(?cli, "starting stellwerk-worker");
    let section = cli.into_section()?;

    let code = if section.process_count > 1 {
        let supervisor = Supervisor::new(worker_commands(&section)?, section.max_restarts);
        let exits = supervisor.run(shutdown_signal()).await;
        for exit in &exits {
            tracing::info!(worker = %exit.name, reason = ?exit.reason, restarts = exit.restarts, "worker process summary");
        }
        group_exit_code(&exits)
    } else {
        let reason = run_worker(&section).await;
        tracing::info!(?reason, "stellwerk-worker exited");
        reason.exit_code()
    };
    std::process::exit(code);
}

/// Run one worker in this process until a signal or the worker itself ends it.
async fn run_worker(section: &WorkerSection) -> ExitReason {
    let worker = match Worker::start(section, Arc::new(Registry::builtin())).await {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to start");
            return ExitReason::from_error(&e);
        }
    };
    tracing::info!(worker_id = %worker.worker_id(), data_address = %worker.data_address(), "worker ready");

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            worker.shutdown();
        }
        _ = stopped(&worker) => tracing::warn!("worker stopped on its own"),
    }
    match worker.join().await {
        Ok(()) => ExitReason::Stopped,
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            ExitReason::from_error(&e)
        }
    }
}

async fn stopped(worker: &WorkerHandle) {
    while !worker.is_finished() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// One single-process invocation of this binary per supervised worker. With
/// a fixed `listen_port`, worker `i` listens on `listen_port + i`.
fn worker_commands(section: &WorkerSection) -> anyhow::Result<Vec<WorkerCommand>> {
    let program = std::env::current_exe()?;
    let base = section.name.clone().unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let commands = (0..section.process_count)
        .map(|i| {
            let name = format!("{base}.{i}");
            let port = match section.listen_port {
                0 => 0,
                first => first.saturating_add(u16::try_from(i).unwrap_or(u16::MAX)),
            };
            let args = vec![
                section.scheduler_address.clone(),
                "--process-count".to_string(),
                "1".to_string(),
                "--threads-per-process".to_string(),
                section.threads.to_string(),
                "--listen".to_string(),
                format!("{}:{port}", section.listen_host),
                "--startup-timeout-secs".to_string(),
                section.startup_timeout_secs.to_string(),
                "--name".to_string(),
                name.clone(),
            ];
            WorkerCommand { name, program: program.clone(), args }
        })
        .collect();
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_accepts_host_or_host_and_port() {
        assert_eq!(parse_listen("10.0.0.7").unwrap(), ("10.0.0.7".to_string(), 0));
        assert_eq!(parse_listen("10.0.0.7:9000").unwrap(), ("10.0.0.7".to_string(), 9000));
        assert!(parse_listen(":9000").is_err());
        assert!(parse_listen("host:port").is_err());
    }

    #[test]
    fn supervised_workers_get_their_own_name_and_port() {
        let section = WorkerSection {
            process_count: 3,
            listen_host: "10.0.0.7".into(),
            listen_port: 9000,
            name: Some("box".into()),
            ..WorkerSection::default()
        };
        let commands = worker_commands(&section).unwrap();
        let names: Vec<&str> = commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["box.0", "box.1", "box.2"]);
        assert!(commands[2].args.windows(2).any(|w| w[0] == "--listen" && w[1] == "10.0.0.7:9002"));
        assert!(commands.iter().all(|c| c.args.windows(2).any(|w| w[0] == "--process-count" && w[1] == "1")));
    }
}
