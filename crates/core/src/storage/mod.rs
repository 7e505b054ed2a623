//! SQLite storage layer for huddle

mod migrations;
mod parse;
mod rooms;
mod traits;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::models::Room;

pub use rooms::RoomStore;
pub use traits::RoomRepository;

/// Main database handle
///
/// The connection is serialized behind a mutex; repository calls are short
/// and never await while holding it.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn())?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

impl RoomRepository for Database {
    fn create(&self, room: &Room) -> Result<()> {
        let conn = self.conn();
        RoomStore::new(&conn).create(room)
    }

    fn get(&self, id: Uuid) -> Result<Option<Room>> {
        let conn = self.conn();
        RoomStore::new(&conn).find_by_id(id)
    }

    fn update(&self, room: &Room) -> Result<()> {
        let conn = self.conn();
        RoomStore::new(&conn).update(room)
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.conn();
        RoomStore::new(&conn).delete(id)
    }

    fn list(&self) -> Result<Vec<Room>> {
        let conn = self.conn();
        RoomStore::new(&conn).list()
    }

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Room>> {
        let conn = self.conn();
        RoomStore::new(&conn).list_by_owner(owner_id)
    }

    fn list_by_participant(&self, user_id: &str) -> Result<Vec<Room>> {
        let conn = self.conn();
        RoomStore::new(&conn).list_by_participant(user_id)
    }
}
