use std::sync::Arc;

use archery_core::error::CoreError;
use archery_core::types::DbId;
use archery_db::models::build_log::BuildLogLine;
use archery_db::repositories::{BuildLogRepo, BuildRepo};
use archery_db::DbPool;
use archery_events::{BuildEvent, BuildSubscription, Delivery};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::ws::manager::WsManager;

/// GET /api/v1/builds/{id}/ws
///
/// Streams the build's events as JSON text frames and closes after the
/// `finish` event. A build that has already finished gets its `finish`
/// event straight away. Lines the event bus dropped for this client are
/// resent from the log store, in order, before anything newer.
pub async fn build_ws_handler(
    ws: WebSocketUpgrade,
    Path(build_id): Path<DbId>,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    // Subscribe before reading the status so a finish in between is not lost.
    let events = state.event_bus.subscribe_build(build_id);

    let build = BuildRepo::find_by_id(&state.pool, build_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Build",
            id: build_id,
        }))?;
    let finished = match build.status().filter(|s| s.is_terminal()) {
        Some(status) => {
            let lines = BuildLogRepo::count_for_build(&state.pool, build_id).await?;
            Some(BuildEvent::finish(
                build_id,
                status,
                u64::try_from(lines).unwrap_or(0),
            ))
        }
        None => None,
    };

    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state.ws_manager, state.pool, events, finished)
    }))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Registers the connection with `WsManager`, spawns a sender task that
/// forwards build events and manager frames, and processes inbound frames
/// until either side closes.
async fn handle_socket(
    socket: WebSocket,
    ws_manager: Arc<WsManager>,
    pool: DbPool,
    mut events: BuildSubscription,
    finished: Option<BuildEvent>,
) {
    let build_id = events.build_id();
    let conn_id = uuid::Uuid::new_v4().to_string();
    let mut rx = ws_manager.add(conn_id.clone(), build_id).await;
    let watchers = ws_manager.watcher_count(build_id).await;
    tracing::info!(
        conn_id = %conn_id,
        build_id,
        watchers,
        "WebSocket connected",
    );

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        if let Some(finish) = finished {
            let _ = send_event(&mut sink, &finish).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let closing = matches!(frame, Message::Close(_));
                    if sink.send(frame).await.is_err() || closing {
                        break;
                    }
                }
                delivery = events.recv() => {
                    let Some(delivery) = delivery else { break };
                    if !forward(&mut sink, &pool, &mut events, delivery).await {
                        tracing::debug!(conn_id = %sender_conn_id, "Build event stream ended");
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(conn_id = %conn_id, "Pong received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    }

    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, build_id, "WebSocket disconnected");
}

/// Send one delivery to the client. Returns `false` once nothing more
/// will be sent: the sink closed, or `finish` went out.
async fn forward(
    sink: &mut SplitSink<WebSocket, Message>,
    pool: &DbPool,
    events: &mut BuildSubscription,
    delivery: Delivery,
) -> bool {
    match delivery {
        Delivery::Event(event) => {
            if send_event(sink, &event).await.is_err() {
                return false;
            }
            if event.is_finish() {
                let _ = sink.send(Message::Close(None)).await;
                return false;
            }
            true
        }
        Delivery::Missed { from_seq } => {
            let build_id = events.build_id();
            let offset = i64::try_from(from_seq).unwrap_or(i64::MAX);
            let stored = match BuildLogRepo::list_for_build_from(pool, build_id, offset).await {
                Ok(stored) => stored,
                Err(e) => {
                    // The gap stays; live delivery continues after it.
                    tracing::warn!(build_id, from_seq, error = %e, "Failed to reload missed build lines");
                    return true;
                }
            };

            let resent = backfill_events(build_id, from_seq, stored);
            let next_seq = from_seq + resent.len() as u64;
            for event in &resent {
                if send_event(sink, event).await.is_err() {
                    return false;
                }
            }
            tracing::debug!(build_id, from_seq, resent = resent.len(), "Resent missed build lines");
            events.caught_up(next_seq);
            true
        }
    }
}

/// Turn stored lines read from position `from_seq` into line events.
fn backfill_events(build_id: DbId, from_seq: u64, stored: Vec<BuildLogLine>) -> Vec<BuildEvent> {
    stored
        .into_iter()
        .zip(from_seq..)
        .map(|(line, seq)| BuildEvent::line(build_id, seq, line.output_channel(), line.line))
        .collect()
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &BuildEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sink.send(Message::Text(text.into())).await
}
