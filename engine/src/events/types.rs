//! Event types for the run event stream.
//!
//! These events drive both the live SSE streams and the per-run replay
//! cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All run lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// First frame on a new stream: the hub's current run, if any
    Connected {
        current_run_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A run was created and scheduling began
    RunStarted {
        run_id: String,
        display_name: String,
        total_tests: i64,
        timestamp: DateTime<Utc>,
    },

    /// A worker picked up a test
    TestStarted {
        run_id: String,
        test_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A test reached a terminal status
    TestCompleted {
        run_id: String,
        test_id: String,
        status: String,
        duration_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// The run finished with final tallies
    RunCompleted {
        run_id: String,
        passed: i64,
        failed: i64,
        skipped: i64,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },

    /// The run was cancelled before completion
    RunCancelled {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An operator asked for cancellation; workers will observe it
    CancelRequested {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The run and its results were deleted
    RunDeleted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Snapshot frame for subscribers joining mid-run
    InitialState {
        run_id: String,
        status: String,
        pending: i64,
        running: i64,
        passed: i64,
        failed: i64,
        skipped: i64,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    /// The run this event belongs to; `None` for unscoped frames.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunEvent::Connected { .. } => None,
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::TestStarted { run_id, .. }
            | RunEvent::TestCompleted { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunCancelled { run_id, .. }
            | RunEvent::CancelRequested { run_id, .. }
            | RunEvent::RunDeleted { run_id, .. }
            | RunEvent::InitialState { run_id, .. } => Some(run_id),
        }
    }

    /// Snake_case event name, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::Connected { .. } => "connected",
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::TestStarted { .. } => "test_started",
            RunEvent::TestCompleted { .. } => "test_completed",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunCancelled { .. } => "run_cancelled",
            RunEvent::CancelRequested { .. } => "cancel_requested",
            RunEvent::RunDeleted { .. } => "run_deleted",
            RunEvent::InitialState { .. } => "initial_state",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RunEvent::Connected { timestamp, .. }
            | RunEvent::RunStarted { timestamp, .. }
            | RunEvent::TestStarted { timestamp, .. }
            | RunEvent::TestCompleted { timestamp, .. }
            | RunEvent::RunCompleted { timestamp, .. }
            | RunEvent::RunCancelled { timestamp, .. }
            | RunEvent::CancelRequested { timestamp, .. }
            | RunEvent::RunDeleted { timestamp, .. }
            | RunEvent::InitialState { timestamp, .. } => *timestamp,
        }
    }

    /// Serialize as one SSE frame: `data: {json}\n\n`.
    pub fn sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }

    /// True once this event terminates its run's stream.
    pub fn ends_run_stream(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunCancelled { .. } | RunEvent::RunDeleted { .. }
        )
    }
}
