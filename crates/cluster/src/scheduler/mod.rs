//! The scheduler: a single-owner state machine plus the socket loop that
//! feeds it.

pub mod diagnostics;
mod placement;
pub mod server;
pub mod state;
pub mod types;


pub use server::{SchedulerHandle, SchedulerServer};
pub use state::SchedulerState;
pub use types::{Command, StateConfig, UnknownWorker};
