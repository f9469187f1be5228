//! Distributed execution for stellwerk graphs.
//!
//! - [`scheduler`]: the state machine that places tasks, and its socket loop
//! - [`worker`]: executes assigned tasks and serves results to peers
//! - [`client`]: submits graphs and awaits their targets
//! - [`supervisor`]: runs several worker processes on one host
//! - [`DistributedExecutor`]: the blocking [`Executor`](stellwerk_core::Executor) on top of a client

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod signal;
pub mod supervisor;
pub mod worker;

pub use client::{Client, ResultFuture, SubmissionHandle};
pub use config::{ClusterConfig, SchedulerSection, WorkerSection};
pub use error::ClusterError;
pub use executor::DistributedExecutor;
pub use scheduler::{SchedulerHandle, SchedulerServer, SchedulerState};
pub use supervisor::{ExitReason, Supervisor, WorkerCommand, WorkerExit};
pub use worker::{Worker, WorkerHandle};
