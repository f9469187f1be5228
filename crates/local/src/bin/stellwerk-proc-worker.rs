//! stellwerk-proc-worker: child process of the process-pool executor.
//!
//! Reads length-prefixed task frames from stdin, runs them against the
//! builtin registry and writes result frames to stdout. Exits when stdin
//! closes. Logs go to stderr.

use clap::Parser;
use stellwerk_core::{CallError, Registry, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Status used by `exit` when the requested code is missing or out of range.
const FALLBACK_EXIT_CODE: i32 = 1;

/// Process-pool child: serves builtin callables over stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-proc-worker", version, about)]
struct Cli {
    /// Also register `exit(code)`, which terminates this process mid-task.
    #[arg(long, env = "STELLWERK_PROC_WORKER_ALLOW_EXIT", default_value_t = false)]
    allow_exit: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let mut registry = Registry::builtin();
    if cli.allow_exit {
        registry.register("exit", |args: &[Value]| -> Result<Value, CallError> {
            std::process::exit(exit_status(args.first().and_then(Value::as_i64)))
        });
    }

    let served = stellwerk_local::serve_stdio(&registry)?;
    info!(served, "stdin closed, exiting");
    Ok(())
}

/// Exit status for `exit(code)`. Codes that do not fit an `i32` fall back
/// instead of wrapping into an unrelated status.
fn exit_status(code: Option<i64>) -> i32 {
    code.and_then(|c| i32::try_from(c).ok()).unwrap_or(FALLBACK_EXIT_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_outside_i32_fall_back() {
        assert_eq!(exit_status(Some(7)), 7);
        assert_eq!(exit_status(Some(-2)), -2);
        assert_eq!(exit_status(None), FALLBACK_EXIT_CODE);
        // 2^32 + 3 would wrap to 3 with a plain cast.
        assert_eq!(exit_status(Some((1i64 << 32) + 3)), FALLBACK_EXIT_CODE);
        assert_eq!(exit_status(Some(i64::MIN)), FALLBACK_EXIT_CODE);
    }
}
