//! HTTP/WebSocket surface.
//!
//! The WebSocket side is the real-time protocol: one session loop per
//! connection translating wire events into room commands and forwarding room
//! events back out. The REST side is thin glue over the room directory and
//! the authenticator; nothing here holds room state.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{Authenticator, UserIdentity};
use crate::config::PassagePool;
use crate::directory::{DirectoryError, RoomDirectory};
use crate::error::CoreError;
use crate::presence::{PresenceMirror, StatsUpdate};
use crate::room::{Registry, RoomCommand, RoomContext, RoomEvent, RoomHandle, open_room};
use crate::types::{ClientMsg, RoomRecord, ServerMsg, now_ms};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub directory: Arc<dyn RoomDirectory>,
    pub authenticator: Arc<dyn Authenticator>,
    pub mirror: PresenceMirror,
    pub passages: Arc<PassagePool>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        authenticator: Arc<dyn Authenticator>,
        passages: Arc<PassagePool>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            directory,
            authenticator,
            mirror: PresenceMirror::default(),
            passages,
            started_at: Instant::now(),
        }
    }

    pub fn room_context(&self) -> RoomContext {
        RoomContext {
            directory: self.directory.clone(),
            passages: self.passages.clone(),
            mirror: Some(self.mirror.clone()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/rooms", post(create_room).get(list_rooms))
        .route("/api/rooms/{id}", get(get_room))
        .route("/api/rooms/{id}/join", put(join_room))
        .route("/api/rooms/{id}/leave", put(leave_room))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── WebSocket session ────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let conn_id = Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {}", conn_id);

    let mut current: Option<RoomHandle> = None;
    let mut events: Option<broadcast::Receiver<RoomEvent>> = None;
    let mut username: Option<String> = None;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(Ok(msg)) = inbound else { break };
                let Message::Text(text) = msg else { continue };

                let client_msg: ClientMsg = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", conn_id, e);
                        continue;
                    }
                };

                match client_msg {
                    ClientMsg::JoinRoom { room_id, username: name } => {
                        let room_id = room_id.trim().to_string();
                        if room_id.is_empty() {
                            let _ = send_msg(&mut sender, &ServerMsg::Error {
                                message: "Failed to join room".to_string(),
                            }).await;
                            continue;
                        }

                        // Joining a new room implicitly leaves the previous one.
                        if let Some(prev) = current.take() {
                            if prev.room_id != room_id {
                                let _ = prev.cmd_tx.send(RoomCommand::Leave {
                                    conn_id: conn_id.clone(),
                                }).await;
                            }
                        }

                        let name = name
                            .filter(|n| !n.trim().is_empty())
                            .unwrap_or_else(|| format!("Guest_{}", &conn_id[..6]));
                        username = Some(name.clone());

                        let handle = open_room(&state.registry, &room_id, state.room_context());
                        events = Some(handle.event_tx.subscribe());
                        let _ = handle.cmd_tx.send(RoomCommand::Join {
                            conn_id: conn_id.clone(),
                            username: name,
                        }).await;
                        current = Some(handle);
                    }

                    ClientMsg::Chat { room_id, user, text } => {
                        let room_id = room_id.trim();
                        if let Some(handle) = state.registry.get(room_id) {
                            let user = user
                                .filter(|u| !u.trim().is_empty())
                                .or_else(|| username.clone());
                            let _ = handle.cmd_tx.send(RoomCommand::Chat {
                                conn_id: conn_id.clone(),
                                user,
                                text,
                            }).await;
                        }
                    }

                    ClientMsg::StartGame { room_id, text, duration } => {
                        match resolve_room(&state, room_id, current.as_ref()) {
                            Some(handle) => {
                                let _ = handle.cmd_tx.send(RoomCommand::Start {
                                    conn_id: conn_id.clone(),
                                    text,
                                    duration,
                                }).await;
                            }
                            None => {
                                let _ = send_msg(&mut sender, &ServerMsg::Error {
                                    message: CoreError::InvalidRoom.to_string(),
                                }).await;
                            }
                        }
                    }

                    ClientMsg::RestartGame { room_id, text, duration } => {
                        match resolve_room(&state, room_id, current.as_ref()) {
                            Some(handle) => {
                                let _ = handle.cmd_tx.send(RoomCommand::Restart {
                                    conn_id: conn_id.clone(),
                                    text,
                                    duration,
                                }).await;
                            }
                            None => {
                                let _ = send_msg(&mut sender, &ServerMsg::Error {
                                    message: CoreError::InvalidRoom.to_string(),
                                }).await;
                            }
                        }
                    }

                    ClientMsg::WpmUpdate {
                        room_id,
                        username: name,
                        wpm,
                        accuracy,
                        progress,
                        is_final,
                    } => {
                        if let Some(handle) = resolve_room(&state, room_id, current.as_ref()) {
                            let update = StatsUpdate {
                                username: name,
                                wpm,
                                accuracy,
                                progress,
                                is_final,
                            };
                            let _ = handle.cmd_tx.send(RoomCommand::UpdateStats {
                                conn_id: conn_id.clone(),
                                update,
                            }).await;
                        }
                    }

                    ClientMsg::EndGame { room_id } => {
                        if let Some(handle) = resolve_room(&state, room_id, current.as_ref()) {
                            let _ = handle.cmd_tx.send(RoomCommand::End {
                                conn_id: conn_id.clone(),
                            }).await;
                        }
                    }

                    ClientMsg::LeaveRoom { room_id } => {
                        if let Some(handle) = resolve_room(&state, room_id, current.as_ref()) {
                            let _ = handle.cmd_tx.send(RoomCommand::Leave {
                                conn_id: conn_id.clone(),
                            }).await;
                            if current.as_ref().is_some_and(|c| c.room_id == handle.room_id) {
                                current = None;
                                events = None;
                            }
                        }
                    }

                    ClientMsg::Ping => {
                        let _ = send_msg(&mut sender, &ServerMsg::Pong {
                            timestamp: now_ms(),
                        }).await;
                    }
                }
            }

            event = room_event(&mut events) => {
                match event {
                    Ok(RoomEvent::SendTo { conn_id: target, msg }) => {
                        if target == conn_id && send_msg(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(RoomEvent::Broadcast { msg }) => {
                        if send_msg(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Connection {} lagged behind, skipped {} events", conn_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                }
            }
        }
    }

    // Socket gone: same teardown as an explicit leave, reason kept for logs.
    tracing::info!("WebSocket disconnected: {}", conn_id);
    if let Some(handle) = current {
        let _ = handle.cmd_tx.send(RoomCommand::Disconnect {
            conn_id,
            reason: "connection closed".to_string(),
        }).await;
    }
}

async fn room_event(
    events: &mut Option<broadcast::Receiver<RoomEvent>>,
) -> Result<RoomEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves the payload room id (falling back to the session's current room)
/// to a live room handle.
fn resolve_room(
    state: &AppState,
    payload_room: Option<String>,
    current: Option<&RoomHandle>,
) -> Option<RoomHandle> {
    let room_id = payload_room
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .or_else(|| current.map(|h| h.room_id.clone()))?;

    if let Some(handle) = current {
        if handle.room_id == room_id {
            return Some(handle.clone());
        }
    }
    state.registry.get(&room_id)
}

async fn send_msg(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

// ─── REST surface ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    name: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoomSummary {
    #[serde(flatten)]
    room: RoomRecord,
    connected: usize,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "timestamp": now_ms(),
        "uptime": state.started_at.elapsed().as_secs(),
        "activeRooms": state.registry.len(),
    }))
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    match state.authenticator.login(&req.username).await {
        Ok(session) => (StatusCode::OK, Json(json!(session))).into_response(),
        Err(e) => message_response(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_identity(&state, &headers).await {
        Ok(identity) => (StatusCode::OK, Json(json!(identity))).into_response(),
        Err(resp) => resp,
    }
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRoomRequest>,
) -> Response {
    let identity = match require_identity(&state, &headers).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };

    if req.name.trim().is_empty() {
        return message_response(StatusCode::BAD_REQUEST, "Room name is required");
    }

    let text = req
        .text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| state.passages.pick());

    match state
        .directory
        .create(&req.name, &text, Some(&identity.username))
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => directory_error_response(e),
    }
}

async fn list_rooms(State(state): State<AppState>) -> Response {
    match state.directory.list().await {
        Ok(records) => {
            let summaries: Vec<RoomSummary> = records
                .into_iter()
                .map(|room| RoomSummary {
                    connected: state.mirror.participant_count(&room.id),
                    room,
                })
                .collect();
            (StatusCode::OK, Json(summaries)).into_response()
        }
        Err(e) => directory_error_response(e),
    }
}

async fn get_room(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.directory.find(&id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => message_response(StatusCode::NOT_FOUND, "Room not found"),
        Err(e) => directory_error_response(e),
    }
}

async fn join_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match require_identity(&state, &headers).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state
        .directory
        .add_participant(&id, &identity.username)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => directory_error_response(e),
    }
}

async fn leave_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match require_identity(&state, &headers).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state
        .directory
        .remove_participant(&id, &identity.username)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => directory_error_response(e),
    }
}

async fn require_identity(state: &AppState, headers: &HeaderMap) -> Result<UserIdentity, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return Err(message_response(
            StatusCode::UNAUTHORIZED,
            "Not authorized, no token",
        ));
    };

    state
        .authenticator
        .identify(token)
        .await
        .map_err(|e| message_response(StatusCode::UNAUTHORIZED, &e.to_string()))
}

fn message_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn directory_error_response(err: DirectoryError) -> Response {
    let status = match err {
        DirectoryError::NotFound => StatusCode::NOT_FOUND,
        DirectoryError::AlreadyJoined | DirectoryError::NotJoined => StatusCode::BAD_REQUEST,
        DirectoryError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Directory error: {}", err);
    }
    message_response(status, &err.to_string())
}
