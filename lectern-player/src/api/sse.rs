//! Server-Sent Events (SSE) stream of player events
//!
//! A client first receives a `Status` event holding the current snapshot,
//! then every [`PlayerEvent`] under its variant name. A client that falls
//! behind the broadcast buffer gets a `Lagged` event with the number of
//! dropped events and a fresh snapshot to resync from.
//!
//! [`PlayerEvent`]: lectern_common::events::PlayerEvent

use crate::api::server::AppContext;
use crate::state::PlayerStatus;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct LaggedNotice {
    skipped: u64,
    status: PlayerStatus,
}

fn json_event(name: &str, data: &impl Serialize) -> Option<Event> {
    match Event::default().event(name).json_data(data) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event = name, "Failed to serialize SSE event: {}", e);
            None
        }
    }
}

/// GET /events - SSE event stream
pub async fn event_stream(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe first so nothing falls between snapshot and stream
    let rx = ctx.state.subscribe_events();
    let snapshot = ctx.state.get_status().await;
    debug!(
        phase = %snapshot.phase,
        generation = snapshot.generation,
        "New SSE client connected"
    );

    let initial = stream::iter(json_event("Status", &snapshot));
    let state = Arc::clone(&ctx.state);
    let events = BroadcastStream::new(rx).filter_map(move |result| {
        let state = Arc::clone(&state);
        async move {
            match result {
                Ok(event) => json_event(event.event_type(), &event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client fell behind, sending resync");
                    let status = state.get_status().await;
                    json_event("Lagged", &LaggedNotice { skipped, status })
                }
            }
        }
    });

    Sse::new(initial.chain(events).map(Ok)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
