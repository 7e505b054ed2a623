//! Shared room cache
//!
//! Maps room ids to the process-wide authoritative copy of the room,
//! loading through the repository on first touch. The per-room write lock
//! linearizes all mutations within one instance; broadcast snapshots take
//! the read lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use huddle_core::{Result, Room, RoomRepository};

pub type SharedRoom = Arc<RwLock<Room>>;

pub struct RoomRegistry {
    repo: Arc<dyn RoomRepository>,
    rooms: RwLock<HashMap<Uuid, SharedRoom>>,
}

impl RoomRegistry {
    pub fn new(repo: Arc<dyn RoomRepository>) -> Self {
        Self {
            repo,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Cached room, loaded from the repository on first access.
    pub async fn get(&self, id: Uuid) -> Result<Option<SharedRoom>> {
        if let Some(room) = self.rooms.read().await.get(&id) {
            return Ok(Some(room.clone()));
        }
        let Some(loaded) = self.repo.get(id)? else {
            return Ok(None);
        };
        let mut rooms = self.rooms.write().await;
        // a racing loader may have beaten us here; keep whichever copy won
        let entry = rooms
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(loaded)));
        Ok(Some(entry.clone()))
    }

    /// Cache a freshly created room.
    pub async fn insert(&self, room: Room) -> SharedRoom {
        let id = room.id;
        let shared = Arc::new(RwLock::new(room));
        self.rooms.write().await.insert(id, shared.clone());
        shared
    }

    /// Drop a room from the cache, e.g. after deletion.
    pub async fn evict(&self, id: Uuid) {
        self.rooms.write().await.remove(&id);
    }

    /// User ids of the room's approved participants; empty when the room
    /// is unknown, so approved-only broadcasts fail closed.
    pub async fn approved_users(&self, id: Uuid) -> HashSet<String> {
        match self.get(id).await {
            Ok(Some(room)) => room.read().await.participants.keys().cloned().collect(),
            _ => HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{Database, Participant, Role, Status, User};

    fn repo_with_room() -> (Arc<dyn RoomRepository>, Room) {
        let repo: Arc<dyn RoomRepository> = Arc::new(Database::open_in_memory().unwrap());
        let mut room = Room::new("Retro".into(), "alice".into(), 3);
        room.participants.insert(
            "alice".into(),
            Participant::new(
                User {
                    id: "alice".into(),
                    email: "alice@example.com".into(),
                    name: "Alice".into(),
                },
                Role::Owner,
                Status::Approved,
            ),
        );
        repo.create(&room).unwrap();
        (repo, room)
    }

    #[tokio::test]
    async fn loads_through_the_repository_once() {
        let (repo, room) = repo_with_room();
        let registry = RoomRegistry::new(repo);

        let first = registry.get(room.id).await.unwrap().unwrap();
        let second = registry.get(room.id).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().await.name, "Retro");
    }

    #[tokio::test]
    async fn missing_room_is_none() {
        let (repo, _) = repo_with_room();
        let registry = RoomRegistry::new(repo);
        assert!(registry.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approved_users_fail_closed() {
        let (repo, room) = repo_with_room();
        let registry = RoomRegistry::new(repo);

        let approved = registry.approved_users(room.id).await;
        assert!(approved.contains("alice"));
        assert!(registry.approved_users(Uuid::new_v4()).await.is_empty());
    }

    #[tokio::test]
    async fn evict_forgets_the_cached_copy() {
        let (repo, room) = repo_with_room();
        let registry = RoomRegistry::new(repo);

        let cached = registry.get(room.id).await.unwrap().unwrap();
        registry.evict(room.id).await;
        let reloaded = registry.get(room.id).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&cached, &reloaded));
    }
}
