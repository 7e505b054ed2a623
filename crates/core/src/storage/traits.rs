//! Storage repository contract
//!
//! The collaboration engine depends only on this trait, allowing for
//! different implementations (SQLite, mock, future network backend).

use uuid::Uuid;

use crate::error::Result;
use crate::models::Room;

/// Durable persistence of rooms.
///
/// `update` must be atomic from the perspective of a concurrent `get`:
/// every accepted mutation writes through the whole aggregate before it is
/// broadcast. The list operations return room headers with empty
/// collections.
pub trait RoomRepository: Send + Sync {
    /// Atomic insert of a room and all nested entities.
    fn create(&self, room: &Room) -> Result<()>;

    /// Full load of one room; missing collections are initialized empty.
    fn get(&self, id: Uuid) -> Result<Option<Room>>;

    /// Atomic write-through of the entire aggregate.
    fn update(&self, room: &Room) -> Result<()>;

    /// Cascading delete.
    fn delete(&self, id: Uuid) -> Result<()>;

    fn list(&self) -> Result<Vec<Room>>;

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Room>>;

    /// Rooms where the user is an approved (not pending) participant.
    fn list_by_participant(&self, user_id: &str) -> Result<Vec<Room>>;
}
