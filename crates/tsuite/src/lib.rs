//! tsuite CLI library: the orchestrator worker pool and background server
//! management. The `tsuite` binary wires these to the command line.

pub mod detach;
pub mod orchestrator;

pub use orchestrator::{execute, RunOptions, RunSummary};
