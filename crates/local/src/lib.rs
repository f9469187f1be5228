//! Executors that run a graph on the local machine.
//!
//! - [`SyncExecutor`]: the calling thread, one task at a time.
//! - [`ThreadPoolExecutor`]: a rayon pool inside this process.
//! - [`ProcessPoolExecutor`]: child processes speaking the [`frame`] protocol.

pub mod cancel;
mod driver;
pub mod frame;
pub mod metrics;
pub mod process;
pub mod serve;
pub mod sync;
pub mod threaded;
pub mod types;

pub use cancel::CancelFlag;
pub use metrics::ExecutorMetrics;
pub use process::ProcessPoolExecutor;
pub use serve::{serve, serve_stdio};
pub use sync::SyncExecutor;
pub use threaded::ThreadPoolExecutor;
pub use types::{resolve_pool_size, ProcessConfig};
