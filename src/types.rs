use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A connected player's live presence within one room.
///
/// `id` is the connection id, not a durable account: a reconnect under a new
/// connection is a brand-new participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub username: String,
    pub wpm: u32,
    pub accuracy: u8,
    pub progress: u8,
    pub is_typing: bool,
    pub is_final: bool,
    pub joined_at: u64,
    pub last_update: u64,
}

/// One row of the sorted leaderboard pushed to every room member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub username: String,
    pub wpm: u32,
    pub accuracy: u8,
    pub progress: u8,
    pub is_typing: bool,
    pub last_update: u64,
    pub is_host: bool,
}

/// Lifecycle of a room's current race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceState {
    Waiting,
    Active,
    Finished,
}

/// A durable room record kept by the room directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    pub text: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub is_active: bool,
    pub created_at: u64,
}

fn default_accuracy() -> f64 {
    100.0
}

/// Messages sent from clients to the server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        username: Option<String>,
    },
    #[serde(rename = "message", rename_all = "camelCase")]
    Chat {
        room_id: String,
        #[serde(default)]
        user: Option<String>,
        text: String,
    },
    #[serde(rename = "startGame", rename_all = "camelCase")]
    StartGame {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        duration: Option<serde_json::Value>,
    },
    #[serde(rename = "restartGame", rename_all = "camelCase")]
    RestartGame {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        duration: Option<serde_json::Value>,
    },
    #[serde(rename = "wpm:update", rename_all = "camelCase")]
    WpmUpdate {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        wpm: f64,
        #[serde(default = "default_accuracy")]
        accuracy: f64,
        #[serde(default)]
        progress: f64,
        #[serde(default)]
        is_final: bool,
    },
    #[serde(rename = "endGame", rename_all = "camelCase")]
    EndGame {
        #[serde(default)]
        room_id: Option<String>,
    },
    #[serde(rename = "leaveRoom", rename_all = "camelCase")]
    LeaveRoom {
        #[serde(default)]
        room_id: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent from the server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "players:update")]
    PlayersUpdate { players: Vec<PlayerView> },
    #[serde(rename = "message", rename_all = "camelCase")]
    Chat {
        id: String,
        user: String,
        text: String,
        time: u64,
    },
    #[serde(rename = "game:start", rename_all = "camelCase")]
    GameStart {
        text: String,
        start_time: u64,
        duration: u64,
        host_id: String,
        room_id: String,
    },
    #[serde(rename = "game:restart", rename_all = "camelCase")]
    GameRestart {
        text: String,
        start_time: u64,
        duration: u64,
        host_id: String,
        room_id: String,
    },
    #[serde(rename = "game:stopTyping", rename_all = "camelCase")]
    GameStopTyping { room_id: String, timestamp: u64 },
    #[serde(rename = "game:end", rename_all = "camelCase")]
    GameEnd { room_id: String, ended_by: String },
    #[serde(rename = "room:deleted", rename_all = "camelCase")]
    RoomDeleted { room_id: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}
