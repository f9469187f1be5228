use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stellwerk_core::ExecutorKind;

/// Run stellwerk task graphs and inspect clusters.
///
/// Backend settings not given as flags come from `STELLWERK_*` environment
/// variables (and `.env`).
#[derive(Parser, Debug)]
#[command(name = "stellwerk", version, about = "Run stellwerk task graphs")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute targets of a JSON graph definition and print them as JSON.
    Run(RunArgs),

    /// Print the tasks a run would execute, in execution order.
    Plan {
        /// Graph definition file.
        graph: PathBuf,

        /// Target key (repeatable; defaults to every key).
        #[arg(long = "target", short = 't')]
        targets: Vec<String>,
    },

    /// Print a scheduler's diagnostics snapshot as JSON.
    Diagnostics {
        /// Scheduler address, e.g. `tcp://127.0.0.1:8786`.
        #[arg(env = "STELLWERK_SCHEDULER")]
        scheduler: String,

        /// Seconds to wait for the scheduler.
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Graph definition file.
    pub graph: PathBuf,

    /// Target key (repeatable; defaults to every key).
    #[arg(long = "target", short = 't')]
    pub targets: Vec<String>,

    /// sync, threads, processes or distributed (default: `STELLWERK_EXECUTOR`).
    #[arg(long, short = 'e')]
    pub executor: Option<ExecutorKind>,

    /// Pool size for the threads and processes executors.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Scheduler address for the distributed executor.
    #[arg(long)]
    pub scheduler: Option<String>,

    /// Print compact JSON on one line.
    #[arg(long)]
    pub compact: bool,
}
