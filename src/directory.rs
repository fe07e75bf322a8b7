//! Durable room directory.
//!
//! The directory keeps the room records of record (name, passage, roster,
//! host of record) behind a trait so the coordination core never cares what
//! backs it. The real-time core consults it for nothing authoritative: it
//! only deletes stale records on teardown, fire-and-forget.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{RoomRecord, now_ms};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Room not found")]
    NotFound,
    #[error("User already in room")]
    AlreadyJoined,
    #[error("User not in room")]
    NotJoined,
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn create(
        &self,
        name: &str,
        text: &str,
        host: Option<&str>,
    ) -> Result<RoomRecord, DirectoryError>;

    async fn list(&self) -> Result<Vec<RoomRecord>, DirectoryError>;

    async fn find(&self, room_id: &str) -> Result<Option<RoomRecord>, DirectoryError>;

    async fn add_participant(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<RoomRecord, DirectoryError>;

    async fn remove_participant(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<RoomRecord, DirectoryError>;

    /// Returns true if a record existed and was deleted.
    async fn delete(&self, room_id: &str) -> Result<bool, DirectoryError>;
}

/// Default single-process directory.
#[derive(Default)]
pub struct MemoryDirectory {
    rooms: DashMap<String, RoomRecord>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomDirectory for MemoryDirectory {
    async fn create(
        &self,
        name: &str,
        text: &str,
        host: Option<&str>,
    ) -> Result<RoomRecord, DirectoryError> {
        let record = RoomRecord {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            text: text.to_string(),
            participants: Vec::new(),
            host: host.map(str::to_string),
            is_active: false,
            created_at: now_ms(),
        };
        self.rooms.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<RoomRecord>, DirectoryError> {
        let mut records: Vec<RoomRecord> =
            self.rooms.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn find(&self, room_id: &str) -> Result<Option<RoomRecord>, DirectoryError> {
        Ok(self.rooms.get(room_id).map(|entry| entry.value().clone()))
    }

    async fn add_participant(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<RoomRecord, DirectoryError> {
        let mut entry = self
            .rooms
            .get_mut(room_id)
            .ok_or(DirectoryError::NotFound)?;
        let record = entry.value_mut();
        if record.participants.iter().any(|p| p == username) {
            return Err(DirectoryError::AlreadyJoined);
        }
        record.participants.push(username.to_string());
        Ok(record.clone())
    }

    async fn remove_participant(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<RoomRecord, DirectoryError> {
        let mut entry = self
            .rooms
            .get_mut(room_id)
            .ok_or(DirectoryError::NotFound)?;
        let record = entry.value_mut();
        if !record.participants.iter().any(|p| p == username) {
            return Err(DirectoryError::NotJoined);
        }
        record.participants.retain(|p| p != username);
        Ok(record.clone())
    }

    async fn delete(&self, room_id: &str) -> Result<bool, DirectoryError> {
        Ok(self.rooms.remove(room_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_find_delete_round_trip() {
        let directory = MemoryDirectory::new();
        let record = directory
            .create("sprint", "some passage", Some("alice"))
            .await
            .unwrap();

        let found = directory.find(&record.id).await.unwrap().unwrap();
        assert_eq!(found.name, "sprint");
        assert_eq!(found.host.as_deref(), Some("alice"));
        assert!(found.participants.is_empty());

        assert!(directory.delete(&record.id).await.unwrap());
        assert!(!directory.delete(&record.id).await.unwrap());
        assert!(directory.find(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roster_rejects_double_join_and_absent_leave() {
        let directory = MemoryDirectory::new();
        let record = directory.create("sprint", "passage", None).await.unwrap();

        directory.add_participant(&record.id, "bob").await.unwrap();
        assert!(matches!(
            directory.add_participant(&record.id, "bob").await,
            Err(DirectoryError::AlreadyJoined)
        ));

        directory
            .remove_participant(&record.id, "bob")
            .await
            .unwrap();
        assert!(matches!(
            directory.remove_participant(&record.id, "bob").await,
            Err(DirectoryError::NotJoined)
        ));

        assert!(matches!(
            directory.add_participant("missing", "bob").await,
            Err(DirectoryError::NotFound)
        ));
    }
}
