mod backend;
mod cli;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use stellwerk_cluster::Client;
use stellwerk_core::{definition, Config, Graph, Key, Results};
use tracing::info;

use crate::cli::{CliArgs, Command, RunArgs};

fn main() -> Result<()> {
    stellwerk_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Run(run_args) => run(run_args),
        Command::Plan { graph, targets } => plan(&graph, &targets),
        Command::Diagnostics { scheduler, timeout_secs } => diagnostics(&scheduler, Duration::from_secs(timeout_secs)),
    }
}

fn load_graph(path: &std::path::Path) -> Result<Graph> {
    definition::load(path).with_context(|| format!("failed to load graph definition '{}'", path.display()))
}

/// Requested targets, or every key of the graph when none were given.
fn resolve_targets(graph: &Graph, targets: &[String]) -> Vec<Key> {
    if targets.is_empty() {
        graph.iter().map(|(k, _)| k.clone()).collect()
    } else {
        targets.iter().map(|t| Key::from(t.as_str())).collect()
    }
}

fn run(args: RunArgs) -> Result<()> {
    let graph = load_graph(&args.graph)?;
    let targets = resolve_targets(&graph, &args.targets);

    let mut config = Config::from_env();
    backend::apply_overrides(&mut config, args.executor, args.workers, args.scheduler);
    config.log_summary();

    let executor = backend::build_executor(&config).context("failed to start executor")?;
    let started = Instant::now();
    let results = executor.run(&graph, &targets)?;
    info!(
        executor = executor.name(),
        targets = targets.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "graph computed"
    );

    let rendered = render(&results);
    if args.compact {
        println!("{}", serde_json::to_string(&rendered)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    }
    Ok(())
}

fn render(results: &Results) -> serde_json::Value {
    let map = results.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect();
    serde_json::Value::Object(map)
}

fn plan(path: &std::path::Path, targets: &[String]) -> Result<()> {
    let graph = load_graph(path)?;
    let targets = resolve_targets(&graph, targets);
    let order = graph.topological_order(&targets)?;
    for key in &order {
        if let Some(task) = graph.get(key.as_str()) {
            let deps: Vec<String> = task.dependencies().iter().map(Key::to_string).collect();
            if deps.is_empty() {
                println!("{key}  {}", task.callable);
            } else {
                println!("{key}  {}  <- {}", task.callable, deps.join(", "));
            }
        }
    }
    Ok(())
}

fn diagnostics(address: &str, timeout: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let snapshot = runtime.block_on(async {
        let client = Client::connect(address, timeout).await?;
        let snapshot = client.diagnostics().await;
        client.close().await;
        snapshot
    })?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
