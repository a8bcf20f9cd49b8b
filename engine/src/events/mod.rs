//! Run event fan-out: typed events, the process-wide hub, and SSE framing.

mod hub;
mod types;

pub use hub::{EventHub, GlobalSubscription, RunSubscription, SharedEventHub};
pub use types::RunEvent;

/// SSE keep-alive comment frame, sent every 15 seconds on idle streams.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Keep-alive interval for SSE streams.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;
