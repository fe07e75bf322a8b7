//! Per-room participant presence.
//!
//! The store is authoritative and ephemeral: it is rebuilt from nothing on
//! restart, and a participant exists only while its connection is alive and
//! joined. [`MemoryPresence`] is the default backing; [`MirroredPresence`]
//! additionally write-throughs every mutation to a shared snapshot map so
//! read-side consumers (room listings) can see live occupancy without going
//! through a room task. Callers must not depend on which variant backs the
//! [`PresenceStore`] they hold.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::CoreError;
use crate::types::{Participant, now_ms};

pub const MAX_WPM: u32 = 1000;

/// A stats merge reported by a participant. Raw values are unclamped wire
/// input; the store clamps on merge.
#[derive(Debug, Clone, Default)]
pub struct StatsUpdate {
    pub username: Option<String>,
    pub wpm: f64,
    pub accuracy: f64,
    pub progress: f64,
    pub is_final: bool,
}

fn clamp_stat(value: f64, fallback: u32, max: u32) -> u32 {
    if value.is_finite() {
        value.clamp(0.0, max as f64) as u32
    } else {
        fallback
    }
}

/// Mapping of connected participant to live stats, per room.
pub trait PresenceStore: Send {
    /// Creates or overwrites the entry for `conn_id`, with default stats.
    fn join(&mut self, room_id: &str, conn_id: &str, username: &str) -> Participant;

    /// Merges a stats report into an existing entry, clamping every numeric
    /// field and recomputing `is_typing`.
    fn update_stats(
        &mut self,
        room_id: &str,
        conn_id: &str,
        update: &StatsUpdate,
    ) -> Result<Participant, CoreError>;

    /// Returns true if a participant existed and was removed.
    fn remove(&mut self, room_id: &str, conn_id: &str) -> bool;

    /// Every current participant, ordered by descending progress with ties
    /// broken by ascending username.
    fn snapshot(&self, room_id: &str) -> Vec<Participant>;

    fn is_empty(&self, room_id: &str) -> bool;

    /// Resets every participant's stats to defaults (race start/restart).
    fn reset_stats(&mut self, room_id: &str);

    /// Drops the whole room (teardown).
    fn clear_room(&mut self, room_id: &str);
}

fn sort_participants(players: &mut [Participant]) {
    players.sort_by(|a, b| {
        b.progress
            .cmp(&a.progress)
            .then_with(|| a.username.cmp(&b.username))
    });
}

/// Default in-memory backing.
#[derive(Default)]
pub struct MemoryPresence {
    rooms: HashMap<String, HashMap<String, Participant>>,
}

impl PresenceStore for MemoryPresence {
    fn join(&mut self, room_id: &str, conn_id: &str, username: &str) -> Participant {
        let now = now_ms();
        let participant = Participant {
            id: conn_id.to_string(),
            username: username.to_string(),
            wpm: 0,
            accuracy: 100,
            progress: 0,
            is_typing: false,
            is_final: false,
            joined_at: now,
            last_update: now,
        };
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id.to_string(), participant.clone());
        participant
    }

    fn update_stats(
        &mut self,
        room_id: &str,
        conn_id: &str,
        update: &StatsUpdate,
    ) -> Result<Participant, CoreError> {
        let player = self
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.get_mut(conn_id))
            .ok_or(CoreError::NotFound)?;

        if let Some(name) = update.username.as_deref() {
            if !name.is_empty() {
                player.username = name.to_string();
            }
        }
        player.wpm = clamp_stat(update.wpm, 0, MAX_WPM);
        player.accuracy = clamp_stat(update.accuracy, 100, 100) as u8;
        player.progress = clamp_stat(update.progress, 0, 100) as u8;
        player.is_final = update.is_final;
        player.is_typing = !player.is_final && player.progress > 0 && player.progress < 100;
        player.last_update = now_ms();

        Ok(player.clone())
    }

    fn remove(&mut self, room_id: &str, conn_id: &str) -> bool {
        self.rooms
            .get_mut(room_id)
            .map(|room| room.remove(conn_id).is_some())
            .unwrap_or(false)
    }

    fn snapshot(&self, room_id: &str) -> Vec<Participant> {
        let mut players: Vec<Participant> = self
            .rooms
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        sort_participants(&mut players);
        players
    }

    fn is_empty(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_none_or(|room| room.is_empty())
    }

    fn reset_stats(&mut self, room_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let now = now_ms();
        for player in room.values_mut() {
            player.wpm = 0;
            player.accuracy = 100;
            player.progress = 0;
            player.is_typing = false;
            player.is_final = false;
            player.last_update = now;
        }
    }

    fn clear_room(&mut self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}

/// Shared read-only view of room occupancy, fed by [`MirroredPresence`].
///
/// This is the mirror of the presence map, never the source of truth: the
/// core stays correct if nothing reads or writes it.
#[derive(Clone, Default)]
pub struct PresenceMirror {
    rooms: Arc<DashMap<String, Vec<Participant>>>,
}

impl PresenceMirror {
    pub fn participants(&self, room_id: &str) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn participant_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    fn store(&self, room_id: &str, players: Vec<Participant>) {
        self.rooms.insert(room_id.to_string(), players);
    }

    fn forget(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}

/// Write-through wrapper around [`MemoryPresence`].
pub struct MirroredPresence {
    inner: MemoryPresence,
    mirror: PresenceMirror,
}

impl MirroredPresence {
    pub fn new(mirror: PresenceMirror) -> Self {
        Self {
            inner: MemoryPresence::default(),
            mirror,
        }
    }

    fn sync(&self, room_id: &str) {
        self.mirror.store(room_id, self.inner.snapshot(room_id));
    }
}

impl PresenceStore for MirroredPresence {
    fn join(&mut self, room_id: &str, conn_id: &str, username: &str) -> Participant {
        let participant = self.inner.join(room_id, conn_id, username);
        self.sync(room_id);
        participant
    }

    fn update_stats(
        &mut self,
        room_id: &str,
        conn_id: &str,
        update: &StatsUpdate,
    ) -> Result<Participant, CoreError> {
        let participant = self.inner.update_stats(room_id, conn_id, update)?;
        self.sync(room_id);
        Ok(participant)
    }

    fn remove(&mut self, room_id: &str, conn_id: &str) -> bool {
        let removed = self.inner.remove(room_id, conn_id);
        if removed {
            self.sync(room_id);
        }
        removed
    }

    fn snapshot(&self, room_id: &str) -> Vec<Participant> {
        self.inner.snapshot(room_id)
    }

    fn is_empty(&self, room_id: &str) -> bool {
        self.inner.is_empty(room_id)
    }

    fn reset_stats(&mut self, room_id: &str) {
        self.inner.reset_stats(room_id);
        self.sync(room_id);
    }

    fn clear_room(&mut self, room_id: &str) {
        self.inner.clear_room(room_id);
        self.mirror.forget(room_id);
    }
}
