use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::distribution::{SubscriberId, Subscription};
use crate::protocol::{
    validate_field, ConnectResponse, InitRequest, MirrorEvent, ResetRequest, StateSnapshot,
    UpdateRequest,
};
use crate::sync::{CoverPoll, LoadOutcome, SyncState};

use super::error::ApiError;
use super::AppState;

/// Removes the subscriber from the cover channel when dropped, including
/// when a long-poll request is cancelled by the client going away.
struct SubscriberGuard {
    sync: SyncState,
    id: SubscriberId,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.sync.unsubscribe(self.id);
    }
}

fn guarded(sync: &SyncState, sub: Subscription) -> (SubscriberGuard, Subscription) {
    let guard = SubscriberGuard {
        sync: sync.clone(),
        id: sub.id,
    };
    (guard, sub)
}

fn subscribe(sync: &SyncState) -> (SubscriberGuard, Subscription) {
    guarded(sync, sync.subscribe())
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: "server shutting down".into(),
    }))
}

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn connect(State(state): State<AppState>) -> Json<ConnectResponse> {
    Json(state.sync.connect())
}

pub(super) async fn init(
    State(state): State<AppState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(req) = payload?;
    let ack = state.sync.init(&req.session_id, req.state, req.timestamp);
    Ok(ack.session_id)
}

pub(super) async fn update(
    State(state): State<AppState>,
    Path(field): Path<String>,
    payload: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    validate_field(&field).map_err(ApiError::InvalidField)?;
    let Json(req) = payload?;
    let ack = state.sync.update(&req.session_id, &field, req.state);
    Ok(ack.session_id)
}

pub(super) async fn log(State(state): State<AppState>, body: Bytes) -> StatusCode {
    state.sync.log(String::from_utf8_lossy(&body).into_owned());
    StatusCode::CREATED
}

pub(super) async fn snapshot(State(state): State<AppState>) -> Json<StateSnapshot> {
    Json(state.sync.snapshot())
}

pub(super) async fn reset(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ConnectResponse>, ApiError> {
    let req: ResetRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResetRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    };
    state.sync.reset(req.debug_logging);
    Ok(Json(state.sync.connect()))
}

#[derive(Deserialize)]
pub(super) struct CoverQuery {
    path: Option<String>,
}

impl CoverQuery {
    fn into_path(self) -> Result<String, ApiError> {
        self.path
            .filter(|p| !p.is_empty())
            .ok_or(ApiError::MissingPath)
    }
}

/// Long-poll for a needed cover. Needed keys are handed out in rotation;
/// when none is needed the request waits for the next one and answers with
/// an empty body on timeout.
pub(super) async fn cover_poll(State(state): State<AppState>) -> Result<String, ApiError> {
    let (_conn, mut shutdown_rx) = state.shutdown.register();
    let sub = match state.sync.poll_cover() {
        CoverPoll::Ready(key) => return Ok(key),
        CoverPoll::Wait(sub) => sub,
    };
    let (_sub_guard, mut sub) = guarded(&state.sync, sub);

    tokio::select! {
        key = sub.recv() => {
            let key = key.unwrap_or_default();
            if !key.is_empty() {
                state.sync.note_polled(&key);
            }
            Ok(key)
        }
        _ = tokio::time::sleep(state.long_poll_timeout) => Ok(String::new()),
        _ = async { let _ = shutdown_rx.wait_for(|down| *down).await; } => Err(ApiError::ShuttingDown),
    }
}

pub(super) async fn cover_upload(
    State(state): State<AppState>,
    Query(query): Query<CoverQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let path = query.into_path()?;
    if body.is_empty() {
        return Err(ApiError::EmptyUpload);
    }

    match state.sync.mark_loaded(&path, body.clone()) {
        LoadOutcome::NotRequired => Ok(StatusCode::OK),
        LoadOutcome::Accepted => {
            if let Some(archive) = &state.archive {
                if let Err(e) = archive.store(&path, &body).await {
                    tracing::warn!(error = %e, path, "failed to archive cover");
                }
            }
            Ok(StatusCode::ACCEPTED)
        }
    }
}

pub(super) async fn cover_image(
    State(state): State<AppState>,
    Query(query): Query<CoverQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let path = query.into_path()?;
    let data = state
        .sync
        .cover(&path)
        .ok_or(ApiError::CoverNotFound(path))?;
    Ok(([(header::CONTENT_TYPE, image_content_type(&data))], data))
}

/// Content type of an embedded picture, from its magic bytes.
fn image_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

pub(super) async fn cover_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_cover_ws(socket, state))
}

/// Push every needed cover key to a producer, one text frame per key.
async fn handle_cover_ws(socket: WebSocket, state: AppState) {
    let (_conn, mut shutdown_rx) = state.shutdown.register();
    let (_sub_guard, mut sub) = subscribe(&state.sync);
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::info!(subscriber = sub.id, "cover producer connected");

    loop {
        tokio::select! {
            key = sub.recv() => {
                match key {
                    Some(key) => {
                        if ws_tx.send(Message::Text(key.into())).await.is_err() {
                            break;
                        }
                    }
                    // Dropped from the channel for falling behind.
                    None => {
                        tracing::warn!(subscriber = sub.id, "cover producer dropped");
                        break;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = ws_tx.send(close_frame()).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    tracing::info!(subscriber = sub.id, "cover producer disconnected");
}

pub(super) async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws_events(socket, state))
}

async fn send_event(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &MirrorEvent,
) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize display event");
            true
        }
    }
}

/// Display event stream: a `sync` snapshot first, then live events.
async fn handle_ws_events(socket: WebSocket, state: AppState) {
    let (_conn, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (snapshot, mut events) = state.sync.attach_display();
    if !send_event(&mut ws_tx, &MirrorEvent::Sync { snapshot }).await {
        return;
    }

    loop {
        tokio::select! {
            result = events.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut ws_tx, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "display lagged, resending snapshot");
                        let snapshot = state.sync.snapshot();
                        if !send_event(&mut ws_tx, &MirrorEvent::Sync { snapshot }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("display stream received shutdown signal, closing");
                    let _ = ws_tx.send(close_frame()).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }
}
