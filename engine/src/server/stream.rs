//! Live event streams over SSE.
//!
//! The global stream opens with a `connected` frame carrying the current
//! run id, replays that run's cached events, then follows the live feed.
//! Per-run streams replay the run's ring and close after the terminal
//! event. Lagged subscribers silently lose frames; producers never block.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use super::{ApiResult, AppState};
use crate::events::{RunEvent, HEARTBEAT_INTERVAL_SECS};

fn frame(event: &RunEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_else(|_| "{}".into()))
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS))
        .text("heartbeat")
}

/// Drain a broadcast receiver as a stream, skipping lagged gaps.
fn live(
    receiver: broadcast::Receiver<RunEvent>,
) -> impl Stream<Item = RunEvent> {
    stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "subscriber lagged, frames dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// `GET /api/events` — everything, for dashboards and the CLI.
pub async fn global_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = state.hub.subscribe_global();
    let opening = std::iter::once(sub.connected)
        .chain(sub.replay)
        .collect::<Vec<_>>();

    let stream = stream::iter(opening)
        .chain(live(sub.receiver))
        .map(|event| Ok(frame(&event)));
    Sse::new(stream).keep_alive(keep_alive())
}

/// `GET /api/runs/:run_id/stream` — one run: a state snapshot, the replay,
/// then live events until the terminal one closes the stream.
pub async fn run_stream(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = state.hub.subscribe_run(&run_id);

    // Subscribers joining mid-run get the current tallies up front.
    let snapshot = state
        .store
        .get_run(&run_id)
        .await
        .ok()
        .map(|run| RunEvent::InitialState {
            run_id: run.run_id.clone(),
            status: run.status.as_str().to_string(),
            pending: run.pending_count,
            running: run.running_count,
            passed: run.passed,
            failed: run.failed,
            skipped: run.skipped,
            timestamp: chrono::Utc::now(),
        });

    let combined = stream::iter(snapshot)
        .chain(stream::iter(sub.replay))
        .chain(live(sub.receiver));

    // Deliver the terminal event, then close without polling for more.
    let stream = stream::unfold((Box::pin(combined), false), |(mut inner, done)| async move {
        if done {
            return None;
        }
        let event = inner.next().await?;
        let done = event.ends_run_stream();
        Some((event, (inner, done)))
    })
    .map(|event| Ok(frame(&event)));
    Sse::new(stream).keep_alive(keep_alive())
}

/// `POST /api/events/emit` — forwarding hop for out-of-process runners.
pub async fn emit(
    State(state): State<AppState>,
    Json(event): Json<RunEvent>,
) -> ApiResult<Json<serde_json::Value>> {
    state.hub.emit(event);
    Ok(Json(serde_json::json!({ "emitted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_live_stream_skips_lag_without_ending() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = Box::pin(live(rx));

        // Overflow the two-slot buffer so the receiver lags.
        for i in 0..5 {
            tx.send(RunEvent::TestStarted {
                run_id: "r".into(),
                test_id: format!("uc/tc{i}"),
                timestamp: Utc::now(),
            })
            .unwrap();
        }
        // The survivors still arrive in order.
        let first = stream.next().await.unwrap();
        match first {
            RunEvent::TestStarted { test_id, .. } => assert_eq!(test_id, "uc/tc3"),
            other => panic!("unexpected event {other:?}"),
        }
        drop(tx);
        assert!(stream.next().await.is_some()); // tc4
        assert!(stream.next().await.is_none()); // channel closed
    }
}
