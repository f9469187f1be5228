mod builtins;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod registry;
pub mod task;
pub mod value;

pub use config::Config;
pub use error::*;
pub use executor::{ExecutionContext, Executor, ExecutorKind, Results};
pub use graph::{Graph, TopologicalOrder};
pub use plan::Plan;
pub use registry::{Callable, Registry};
pub use task::{Arg, Key, Task};
pub use value::Value;
