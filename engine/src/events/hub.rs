//! Process-wide event fan-out hub.
//!
//! Two subscription modes: global (every event) and per-run. Emitting is
//! non-blocking; broadcast channels drop frames to lagging subscribers
//! rather than stalling producers. Run-scoped events also land in a bounded
//! per-run replay ring so late subscribers catch up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::RunEvent;

/// Broadcast channel capacity per subscriber
const CHANNEL_CAPACITY: usize = 256;

/// Replay ring size per run
const REPLAY_CAPACITY: usize = 100;

/// Shared reference to the hub
pub type SharedEventHub = Arc<EventHub>;

struct RunChannel {
    sender: broadcast::Sender<RunEvent>,
    replay: VecDeque<RunEvent>,
}

impl RunChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            replay: VecDeque::with_capacity(REPLAY_CAPACITY),
        }
    }
}

#[derive(Default)]
struct HubState {
    current_run: Option<String>,
    per_run: HashMap<String, RunChannel>,
}

/// Event fan-out hub with global and per-run subscriptions
pub struct EventHub {
    global: broadcast::Sender<RunEvent>,
    state: RwLock<HubState>,
}

/// A new global subscription: the `connected` frame, the current run's
/// replay, then the live receiver.
pub struct GlobalSubscription {
    pub connected: RunEvent,
    pub replay: Vec<RunEvent>,
    pub receiver: broadcast::Receiver<RunEvent>,
}

/// A per-run subscription: the run's replay, then the live receiver.
pub struct RunSubscription {
    pub replay: Vec<RunEvent>,
    pub receiver: broadcast::Receiver<RunEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            global,
            state: RwLock::new(HubState::default()),
        }
    }

    /// Create a shared reference to this hub.
    pub fn shared(self) -> SharedEventHub {
        Arc::new(self)
    }

    /// Publish an event. Never blocks; events without a run id reach global
    /// subscribers only.
    pub fn emit(&self, event: RunEvent) {
        let run_id = event.run_id().map(str::to_string);

        if let Some(run_id) = &run_id {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

            // Track the hub's current run across run lifecycle events.
            match &event {
                RunEvent::RunStarted { .. } => {
                    state.current_run = Some(run_id.clone());
                }
                RunEvent::RunCompleted { .. } | RunEvent::RunCancelled { .. } => {
                    if state.current_run.as_deref() == Some(run_id) {
                        state.current_run = None;
                    }
                }
                _ => {}
            }

            let channel = state
                .per_run
                .entry(run_id.clone())
                .or_insert_with(RunChannel::new);
            if channel.replay.len() == REPLAY_CAPACITY {
                channel.replay.pop_front();
            }
            channel.replay.push_back(event.clone());
            // No receivers is fine; the replay ring still has the event.
            let _ = channel.sender.send(event.clone());

            // Deleted runs keep no cache around.
            if matches!(event, RunEvent::RunDeleted { .. }) {
                state.per_run.remove(run_id);
            }
        }

        debug!(event_type = event.event_type(), run = ?run_id, "event emitted");
        let _ = self.global.send(event);
    }

    /// Subscribe to every event. The caller sends `connected`, replays the
    /// current run, then drains the receiver.
    pub fn subscribe_global(&self) -> GlobalSubscription {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let connected = RunEvent::Connected {
            current_run_id: state.current_run.clone(),
            timestamp: Utc::now(),
        };
        let replay = state
            .current_run
            .as_ref()
            .and_then(|id| state.per_run.get(id))
            .map(|c| c.replay.iter().cloned().collect())
            .unwrap_or_default();
        GlobalSubscription {
            connected,
            replay,
            receiver: self.global.subscribe(),
        }
    }

    /// Subscribe to one run's events with replay.
    pub fn subscribe_run(&self, run_id: &str) -> RunSubscription {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let channel = state
            .per_run
            .entry(run_id.to_string())
            .or_insert_with(RunChannel::new);
        RunSubscription {
            replay: channel.replay.iter().cloned().collect(),
            receiver: channel.sender.subscribe(),
        }
    }

    /// The run a `run_started` most recently announced, until it finishes.
    pub fn current_run(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current_run
            .clone()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
