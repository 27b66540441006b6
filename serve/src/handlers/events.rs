//! SSE projection of the event bus.
//!
//! Frames are `id: <seq>` / `event: <kind>` / `data: <json>`. A client
//! reconnecting with `Last-Event-Id` gets the persisted events it missed
//! before the live tail; duplicates across the seam are suppressed by seq.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use kitt::bus::Subscription;
use kitt::store::EventRecord;
use kitt::KittError;
use stream_event::{Envelope, SourceId};

use crate::app::AppState;
use crate::error::ApiError;

const KEEP_ALIVE: Duration = Duration::from_secs(15);
const REPLAY_LIMIT: u32 = 1_000;
const STREAM_BUFFER: usize = 64;

type EventStream = Sse<ReceiverStream<Result<Event, Infallible>>>;

pub async fn stream_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<EventStream, ApiError> {
    open_stream(state, None, &headers).await
}

pub async fn stream_source(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
) -> Result<EventStream, ApiError> {
    let source: SourceId = source
        .parse()
        .map_err(KittError::Validation)?;
    open_stream(state, Some(source), &headers).await
}

async fn open_stream(
    state: Arc<AppState>,
    filter: Option<SourceId>,
    headers: &HeaderMap,
) -> Result<EventStream, ApiError> {
    let last_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    // Subscribe before reading history so nothing falls between the two.
    let sub = state.ctrl.bus.subscribe(filter.clone());
    let history = {
        let source = filter.as_ref().map(|s| s.to_string());
        state
            .ctrl
            .run_blocking(move |ctrl| {
                Ok(ctrl
                    .store
                    .events_after(last_seq, source.as_deref(), REPLAY_LIMIT)?)
            })
            .await?
    };

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(forward(tx, sub, history));
    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

async fn forward(
    tx: mpsc::Sender<Result<Event, Infallible>>,
    mut sub: Subscription,
    history: Vec<EventRecord>,
) {
    let mut max_seq = 0u64;
    for record in history {
        max_seq = max_seq.max(record.seq);
        let event = Event::default()
            .id(record.seq.to_string())
            .event(record.event_type.clone())
            .data(record.payload_json.clone());
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
    while let Some(bus_event) = sub.recv().await {
        if bus_event.seq <= max_seq {
            continue;
        }
        let envelope = Envelope::new()
            .with_seq(bus_event.seq)
            .with_source(bus_event.source.to_string())
            .with_ts(bus_event.ts.to_rfc3339());
        let payload = match stream_event::to_json(&bus_event.event, &envelope) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "event not serializable, skipping");
                continue;
            }
        };
        let event = Event::default()
            .id(bus_event.seq.to_string())
            .event(bus_event.event.kind())
            .data(payload.to_string());
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
}
