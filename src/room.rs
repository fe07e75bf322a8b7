//! Per-room coordination.
//!
//! Each active room is one spawned task owning all of the room's mutable
//! state. Connection handlers talk to it over an mpsc command channel and
//! listen on a broadcast event channel, so every read-modify-write on a room
//! is linearized without any cross-room locking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};

use crate::config::PassagePool;
use crate::directory::RoomDirectory;
use crate::error::CoreError;
use crate::presence::{MemoryPresence, MirroredPresence, PresenceMirror, PresenceStore, StatsUpdate};
use crate::types::{PlayerView, RaceState, ServerMsg, now_ms};

const MIN_DURATION_SECS: u64 = 10;
const MAX_DURATION_SECS: u64 = 300;
const DEFAULT_DURATION_SECS: u64 = 30;
const MAX_CHAT_LEN: usize = 500;
const BROADCAST_INTERVAL: Duration = Duration::from_millis(200);

/// Commands the connection handlers send to a room task.
#[derive(Debug, Clone)]
pub enum RoomCommand {
    Join {
        conn_id: String,
        username: String,
    },
    Chat {
        conn_id: String,
        user: Option<String>,
        text: String,
    },
    Start {
        conn_id: String,
        text: Option<String>,
        duration: Option<serde_json::Value>,
    },
    Restart {
        conn_id: String,
        text: Option<String>,
        duration: Option<serde_json::Value>,
    },
    UpdateStats {
        conn_id: String,
        update: StatsUpdate,
    },
    End {
        conn_id: String,
    },
    Leave {
        conn_id: String,
    },
    Disconnect {
        conn_id: String,
        reason: String,
    },
    /// Posted by the armed stop-timer; ignored unless `generation` still
    /// matches the room's current race generation.
    RaceTimeout {
        generation: u64,
    },
}

/// Events flowing from a room task to the connection handlers.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Deliver a message to one specific connection.
    SendTo { conn_id: String, msg: ServerMsg },
    /// Deliver a message to every connection in the room.
    Broadcast { msg: ServerMsg },
}

#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: String,
    pub cmd_tx: mpsc::Sender<RoomCommand>,
    pub event_tx: broadcast::Sender<RoomEvent>,
}

/// Collaborators a room task needs besides its own state.
#[derive(Clone)]
pub struct RoomContext {
    pub directory: Arc<dyn RoomDirectory>,
    pub passages: Arc<PassagePool>,
    pub mirror: Option<PresenceMirror>,
}

/// Registry of all live rooms.
pub struct Registry {
    rooms: DashMap<String, RoomHandle>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
        })
    }

    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Determines which connection may issue privileged commands for a room.
///
/// Host identity is the connection, never a durable account: the first joiner
/// of a room generation becomes host and stays host until the room dies.
#[derive(Debug, Default)]
pub struct HostAuthority {
    host: Option<String>,
}

impl HostAuthority {
    /// First joiner wins; later calls are no-ops.
    pub fn assign_if_unset(&mut self, conn_id: &str) {
        if self.host.is_none() {
            self.host = Some(conn_id.to_string());
        }
    }

    pub fn is_host(&self, conn_id: &str) -> bool {
        self.host.as_deref() == Some(conn_id)
    }

    pub fn current(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn clear(&mut self) {
        self.host = None;
    }
}

/// Validates a race duration from untrusted wire input.
///
/// Numbers and numeric strings clamp into `[10, 300]`; anything unparsable
/// falls back to 30 seconds.
pub fn validate_duration(raw: Option<&serde_json::Value>) -> u64 {
    let Some(value) = raw else {
        return DEFAULT_DURATION_SECS;
    };

    let parsed = if let Some(n) = value.as_i64() {
        Some(n)
    } else if let Some(f) = value.as_f64() {
        Some(f as i64)
    } else if let Some(s) = value.as_str() {
        s.trim().parse::<i64>().ok()
    } else {
        None
    };

    match parsed {
        Some(n) => n.clamp(MIN_DURATION_SECS as i64, MAX_DURATION_SECS as i64) as u64,
        None => DEFAULT_DURATION_SECS,
    }
}

struct RoomState {
    room_id: String,
    presence: Box<dyn PresenceStore>,
    host: HostAuthority,
    race: RaceState,
    target_text: String,
    duration_secs: u64,
    race_started_at: Option<u64>,
    race_generation: u64,
    last_broadcast_at: Option<Instant>,
    ctx: RoomContext,
}

impl RoomState {
    fn broadcast(&self, tx: &broadcast::Sender<RoomEvent>, msg: ServerMsg) {
        let _ = tx.send(RoomEvent::Broadcast { msg });
    }

    fn send_to(&self, tx: &broadcast::Sender<RoomEvent>, conn_id: &str, msg: ServerMsg) {
        let _ = tx.send(RoomEvent::SendTo {
            conn_id: conn_id.to_string(),
            msg,
        });
    }

    fn compute_view(&self) -> Vec<PlayerView> {
        self.presence
            .snapshot(&self.room_id)
            .into_iter()
            .filter(|p| !p.username.is_empty())
            .map(|p| PlayerView {
                is_host: self.host.is_host(&p.id),
                username: p.username,
                wpm: p.wpm,
                accuracy: p.accuracy,
                progress: p.progress,
                is_typing: p.is_typing,
                last_update: p.last_update,
            })
            .collect()
    }

    /// Pushes the sorted player view to the room. Non-forced pushes are
    /// throttled to one per 200 ms per room; final reports and room commands
    /// pass `force` to bypass the throttle.
    fn broadcast_players(&mut self, tx: &broadcast::Sender<RoomEvent>, force: bool) {
        if !force {
            if let Some(last) = self.last_broadcast_at {
                if last.elapsed() < BROADCAST_INTERVAL {
                    return;
                }
            }
        }
        self.last_broadcast_at = Some(Instant::now());
        let players = self.compute_view();
        self.broadcast(tx, ServerMsg::PlayersUpdate { players });
    }

    /// Invalidates any armed stop-timer by moving to the next generation.
    fn bump_generation(&mut self) -> u64 {
        self.race_generation += 1;
        self.race_generation
    }
}

/// What a departure did to the room.
enum Departure {
    Kept,
    Empty,
    HostLeft,
}

/// Returns the handle for `room_id`, spawning the room task on first use.
pub fn open_room(registry: &Arc<Registry>, room_id: &str, ctx: RoomContext) -> RoomHandle {
    match registry.rooms.entry(room_id.to_string()) {
        Entry::Occupied(entry) => entry.get().clone(),
        Entry::Vacant(entry) => {
            let (cmd_tx, cmd_rx) = mpsc::channel(256);
            let (event_tx, _) = broadcast::channel(256);

            let handle = RoomHandle {
                room_id: room_id.to_string(),
                cmd_tx: cmd_tx.clone(),
                event_tx: event_tx.clone(),
            };
            entry.insert(handle.clone());

            let presence: Box<dyn PresenceStore> = match &ctx.mirror {
                Some(mirror) => Box::new(MirroredPresence::new(mirror.clone())),
                None => Box::new(MemoryPresence::default()),
            };
            let state = RoomState {
                room_id: room_id.to_string(),
                presence,
                host: HostAuthority::default(),
                race: RaceState::Waiting,
                target_text: String::new(),
                duration_secs: DEFAULT_DURATION_SECS,
                race_started_at: None,
                race_generation: 0,
                last_broadcast_at: None,
                ctx,
            };

            tokio::spawn(room_task(state, cmd_rx, event_tx, registry.clone(), cmd_tx));
            tracing::info!("Room opened: {}", room_id);

            handle
        }
    }
}

async fn room_task(
    mut state: RoomState,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
    event_tx: broadcast::Sender<RoomEvent>,
    registry: Arc<Registry>,
    cmd_tx: mpsc::Sender<RoomCommand>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let done = match cmd {
            RoomCommand::Join { conn_id, username } => {
                handle_join(&mut state, &event_tx, conn_id, username);
                false
            }
            RoomCommand::Chat {
                conn_id,
                user,
                text,
            } => {
                handle_chat(&mut state, &event_tx, conn_id, user, text);
                false
            }
            RoomCommand::Start {
                conn_id,
                text,
                duration,
            } => {
                handle_start(&mut state, &event_tx, &cmd_tx, conn_id, text, duration);
                false
            }
            RoomCommand::Restart {
                conn_id,
                text,
                duration,
            } => {
                handle_restart(&mut state, &event_tx, conn_id, text, duration);
                false
            }
            RoomCommand::UpdateStats { conn_id, update } => {
                handle_update_stats(&mut state, &event_tx, conn_id, update);
                false
            }
            RoomCommand::End { conn_id } => {
                handle_end(&mut state, &event_tx, conn_id);
                false
            }
            RoomCommand::Leave { conn_id } => {
                handle_departure(&mut state, &event_tx, &conn_id)
            }
            RoomCommand::Disconnect { conn_id, reason } => {
                tracing::info!("Connection {} dropped from room {}: {}", conn_id, state.room_id, reason);
                handle_departure(&mut state, &event_tx, &conn_id)
            }
            RoomCommand::RaceTimeout { generation } => {
                handle_race_timeout(&mut state, &event_tx, generation);
                false
            }
        };

        if done {
            break;
        }
    }

    state.bump_generation();
    state.host.clear();
    state.presence.clear_room(&state.room_id);
    registry.remove(&state.room_id);
    tracing::info!("Room {} task ended", state.room_id);
}

fn handle_join(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    conn_id: String,
    username: String,
) {
    state.presence.join(&state.room_id, &conn_id, &username);
    state.host.assign_if_unset(&conn_id);
    tracing::info!("{} joined room {}", username, state.room_id);
    state.broadcast_players(tx, true);
}

fn handle_chat(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    conn_id: String,
    user: Option<String>,
    text: String,
) {
    if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
        tracing::debug!("Dropping chat message from {} in room {}", conn_id, state.room_id);
        return;
    }
    let sanitized: String = text.trim().chars().take(MAX_CHAT_LEN).collect();
    if sanitized.is_empty() {
        return;
    }

    let user = user
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "Anonymous".to_string());

    state.broadcast(
        tx,
        ServerMsg::Chat {
            id: message_id(),
            user,
            text: sanitized,
            time: now_ms(),
        },
    );
}

fn handle_start(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    cmd_tx: &mpsc::Sender<RoomCommand>,
    conn_id: String,
    text: Option<String>,
    duration: Option<serde_json::Value>,
) {
    if !state.host.is_host(&conn_id) {
        let message = CoreError::NotHost("Only the host can start the game").to_string();
        state.send_to(tx, &conn_id, ServerMsg::Error { message });
        return;
    }

    let duration = validate_duration(duration.as_ref());
    let text = text
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.ctx.passages.pick());

    state.presence.reset_stats(&state.room_id);
    state.broadcast_players(tx, true);

    let generation = state.bump_generation();
    let started_at = now_ms();
    state.race = RaceState::Active;
    state.target_text = text.clone();
    state.duration_secs = duration;
    state.race_started_at = Some(started_at);

    state.broadcast(
        tx,
        ServerMsg::GameStart {
            text,
            start_time: started_at,
            duration,
            host_id: conn_id,
            room_id: state.room_id.clone(),
        },
    );

    arm_stop_timer(cmd_tx.clone(), duration, generation);
    tracing::info!("Race started in room {} ({}s)", state.room_id, duration);
}

fn handle_restart(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    conn_id: String,
    text: Option<String>,
    duration: Option<serde_json::Value>,
) {
    if !state.host.is_host(&conn_id) {
        let message = CoreError::NotHost("Only the host can restart the game").to_string();
        state.send_to(tx, &conn_id, ServerMsg::Error { message });
        return;
    }

    let duration = validate_duration(duration.as_ref());
    let text = text
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.ctx.passages.pick());

    // Invalidate any in-flight stop-timer before rewinding to Waiting.
    state.bump_generation();
    state.race = RaceState::Waiting;
    state.race_started_at = None;
    state.target_text = text.clone();
    state.duration_secs = duration;

    state.presence.reset_stats(&state.room_id);
    state.broadcast_players(tx, true);

    // The race does not auto-start: a subsequent start arms the timer.
    state.broadcast(
        tx,
        ServerMsg::GameRestart {
            text,
            start_time: now_ms(),
            duration,
            host_id: conn_id,
            room_id: state.room_id.clone(),
        },
    );
    tracing::info!("Race restarted in room {} ({}s)", state.room_id, duration);
}

fn handle_update_stats(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    conn_id: String,
    update: StatsUpdate,
) {
    match state.presence.update_stats(&state.room_id, &conn_id, &update) {
        Ok(player) => state.broadcast_players(tx, player.is_final),
        Err(CoreError::NotFound) => {
            tracing::debug!("Stats report for unknown participant {} in room {}", conn_id, state.room_id);
        }
        Err(err) => {
            tracing::warn!("Stats update failed in room {}: {}", state.room_id, err);
        }
    }
}

fn handle_end(state: &mut RoomState, tx: &broadcast::Sender<RoomEvent>, conn_id: String) {
    if !state.host.is_host(&conn_id) {
        let message = CoreError::NotHost("Only host can end game").to_string();
        state.send_to(tx, &conn_id, ServerMsg::Error { message });
        return;
    }

    state.bump_generation();
    state.race = RaceState::Waiting;
    state.race_started_at = None;

    state.broadcast(
        tx,
        ServerMsg::GameEnd {
            room_id: state.room_id.clone(),
            ended_by: conn_id,
        },
    );
    tracing::info!("Race ended by host in room {}", state.room_id);
}

fn handle_departure(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    conn_id: &str,
) -> bool {
    match departure_kind(state, tx, conn_id) {
        Departure::Kept => false,
        Departure::Empty => {
            tracing::info!("Room {} empty, cleaning up", state.room_id);
            true
        }
        Departure::HostLeft => {
            tracing::info!("Host left room {}, tearing it down", state.room_id);
            delete_room_record(state);
            true
        }
    }
}

fn departure_kind(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    conn_id: &str,
) -> Departure {
    if state.host.is_host(conn_id) {
        // Host departure terminates the room for everyone.
        state.broadcast(
            tx,
            ServerMsg::RoomDeleted {
                room_id: state.room_id.clone(),
            },
        );
        return Departure::HostLeft;
    }

    // A second leave for the same connection is a no-op.
    if !state.presence.remove(&state.room_id, conn_id) {
        return Departure::Kept;
    }

    if state.presence.is_empty(&state.room_id) {
        // No one left to notify.
        return Departure::Empty;
    }

    state.broadcast_players(tx, true);
    Departure::Kept
}

/// Fire-and-forget deletion of the durable room record. A directory failure
/// must never hold up the real-time teardown.
fn delete_room_record(state: &RoomState) {
    let directory = state.ctx.directory.clone();
    let room_id = state.room_id.clone();
    tokio::spawn(async move {
        match directory.delete(&room_id).await {
            Ok(true) => tracing::debug!("Deleted room record {}", room_id),
            Ok(false) => {}
            Err(err) => tracing::warn!("Failed to delete room record {}: {}", room_id, err),
        }
    });
}

fn handle_race_timeout(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    generation: u64,
) {
    if generation != state.race_generation || state.race != RaceState::Active {
        tracing::debug!("Ignoring stale stop-timer for room {}", state.room_id);
        return;
    }

    state.race = RaceState::Finished;
    state.broadcast(
        tx,
        ServerMsg::GameStopTyping {
            room_id: state.room_id.clone(),
            timestamp: now_ms(),
        },
    );
    tracing::info!("Race timer expired in room {}", state.room_id);
}

/// One-shot stop-timer for the current race generation. The firing posts a
/// command back to the room task; a generation mismatch there makes stale
/// timers harmless.
fn arm_stop_timer(cmd_tx: mpsc::Sender<RoomCommand>, duration_secs: u64, generation: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(duration_secs)).await;
        let _ = cmd_tx.send(RoomCommand::RaceTimeout { generation }).await;
    });
}

fn message_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
        .collect();
    format!("msg_{}_{}", now_ms(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_assignment_wins() {
        let mut host = HostAuthority::default();
        host.assign_if_unset("c1");
        host.assign_if_unset("c2");
        assert!(host.is_host("c1"));
        assert!(!host.is_host("c2"));
        assert_eq!(host.current(), Some("c1"));

        host.clear();
        assert!(!host.is_host("c1"));
        assert_eq!(host.current(), None);
    }

    #[test]
    fn duration_clamps_to_nearest_bound() {
        assert_eq!(validate_duration(Some(&json!(5))), 10);
        assert_eq!(validate_duration(Some(&json!(1000))), 300);
        assert_eq!(validate_duration(Some(&json!(42))), 42);
        assert_eq!(validate_duration(Some(&json!(-7))), 10);
    }

    #[test]
    fn duration_accepts_numeric_strings() {
        assert_eq!(validate_duration(Some(&json!("45"))), 45);
        assert_eq!(validate_duration(Some(&json!(" 500 "))), 300);
    }

    #[test]
    fn unparsable_duration_defaults_to_thirty() {
        assert_eq!(validate_duration(None), 30);
        assert_eq!(validate_duration(Some(&json!("soon"))), 30);
        assert_eq!(validate_duration(Some(&json!(null))), 30);
        assert_eq!(validate_duration(Some(&json!({"secs": 60}))), 30);
    }

    #[test]
    fn chat_ids_are_prefixed_and_unique_enough() {
        let a = message_id();
        let b = message_id();
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
    }
}
