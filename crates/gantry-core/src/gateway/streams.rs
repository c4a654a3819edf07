//! Reserved push endpoints: the live-reload SSE stream and the mocked
//! WebSocket / EventSource streams.

use super::SharedState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::mock::{replay, EventStep, PushMessage, StreamProtocol};

/// `/__gantry/reload`: reload notifications, one JSON object per SSE
/// message. Opens with a retry hint so browsers reconnect quickly after
/// a gateway restart.
pub(super) async fn reload_events(State(state): State<SharedState>) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe();
    let hello = futures::stream::iter([Ok::<_, Infallible>(
        Event::default().retry(Duration::from_secs(1)).comment("connected"),
    )]);
    let updates = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    return Some((Ok(Event::default().data(message.to_json())), rx));
                }
                // A lagged client just misses old notifications.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(hello.chain(updates)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    /// Full URL of the mocked stream this connection stands in for.
    stream: Option<String>,
}

fn stream_key(query: &StreamQuery) -> Option<(String, String)> {
    let raw = query.stream.as_deref()?;
    let parsed = url::Url::parse(raw).ok()?;
    Some((
        format!("{}://{}", parsed.scheme(), parsed.authority()),
        parsed.path().to_string(),
    ))
}

/// `/__gantry/ws?stream=`: mocked WebSocket. Replays the connect
/// sequence on open; incoming text frames name further sequences.
pub(super) async fn ws_stream(
    State(state): State<SharedState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some((origin, path)) = stream_key(&query) else {
        return (StatusCode::BAD_REQUEST, "missing or invalid stream tag").into_response();
    };
    if state.mocks.stream_protocol(&origin, &path) != Some(StreamProtocol::Ws) {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| run_ws(socket, state, origin, path))
}

async fn run_ws(mut socket: WebSocket, state: SharedState, origin: String, path: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PushMessage>();
    let mut replays = tokio::task::JoinSet::new();

    if let Some(steps) = state.mocks.sequence_for(&origin, &path, "connect") {
        spawn_replay(&mut replays, steps, tx.clone());
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(name))) => {
                    if let Some(steps) = state.mocks.sequence_for(&origin, &path, name.trim()) {
                        spawn_replay(&mut replays, steps, tx.clone());
                    } else {
                        tracing::debug!(stream = %path, event = %name, "no mocked sequence");
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if socket.send(Message::Text(message.data)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Dropping the stream cancels every pending replay delay.
    replays.abort_all();
}

fn spawn_replay(
    replays: &mut tokio::task::JoinSet<()>,
    steps: Vec<EventStep>,
    tx: mpsc::UnboundedSender<PushMessage>,
) {
    replays.spawn(async move {
        replay(steps, move |message| tx.send(message).is_ok()).await;
    });
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// `/__gantry/es?stream=`: mocked EventSource. One-way, only the
/// connect sequence replays, with event names and ids preserved.
pub(super) async fn es_stream(
    State(state): State<SharedState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let Some((origin, path)) = stream_key(&query) else {
        return (StatusCode::BAD_REQUEST, "missing or invalid stream tag").into_response();
    };
    if state.mocks.stream_protocol(&origin, &path) != Some(StreamProtocol::Es) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let steps = state
        .mocks
        .sequence_for(&origin, &path, "connect")
        .unwrap_or_default();
    let (tx, rx) = mpsc::unbounded_channel::<PushMessage>();
    let task = tokio::spawn(async move {
        replay(steps, move |message| tx.send(message).is_ok()).await;
    });
    let guard = AbortOnDrop(task.abort_handle());

    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let message = rx.recv().await?;
        let mut event = Event::default().data(message.data);
        if let Some(name) = message.event {
            event = event.event(name);
        }
        if let Some(id) = message.id {
            event = event.id(id);
        }
        Some((Ok::<_, Infallible>(event), (rx, guard)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
