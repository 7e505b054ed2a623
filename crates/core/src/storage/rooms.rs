//! Room storage operations
//!
//! The whole aggregate is written through on every accepted mutation:
//! `update` rewrites the room header and reinserts its child rows inside
//! one transaction, giving snapshot semantics without a replay log.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ActionItem, Participant, Room, Status, Ticket, User};
use super::parse;

pub struct RoomStore<'a> {
    conn: &'a Connection,
}

impl<'a> RoomStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a room and all nested entities atomically.
    pub fn create(&self, room: &Room) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO rooms (id, name, owner_id, phase, votes_per_user, auto_approve, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                room.id.to_string(),
                room.name,
                room.owner_id,
                room.phase.as_str(),
                room.votes_per_user,
                room.auto_approve,
                room.created_at.to_rfc3339(),
            ],
        )?;
        Self::insert_children(&tx, room)?;
        tx.commit()?;
        Ok(())
    }

    /// Full load; absent rooms yield `None`, missing collections come back
    /// empty.
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Room>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, owner_id, phase, votes_per_user, auto_approve, created_at
             FROM rooms WHERE id = ?1",
        )?;
        let room = stmt
            .query_row(params![id.to_string()], Self::room_row)
            .optional()?;
        let Some(mut room) = room else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT user_id, user_email, user_name, role, status, votes_used
             FROM participants WHERE room_id = ?1",
        )?;
        let participants = stmt.query_map(params![id.to_string()], |row| {
            let user = User {
                id: row.get(0)?,
                email: row.get(1)?,
                name: row.get(2)?,
            };
            Ok(Participant {
                user,
                role: parse::parse_role(&row.get::<_, String>(3)?)?,
                status: parse::parse_status(&row.get::<_, String>(4)?)?,
                votes_used: row.get(5)?,
            })
        })?;
        for participant in participants {
            let participant = participant?;
            let key = participant.user.id.clone();
            match participant.status {
                Status::Approved => room.participants.insert(key, participant),
                Status::Pending => room.pending_participants.insert(key, participant),
            };
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, content, author_id, parent_id, votes, voter_ids, covered, created_at
             FROM tickets WHERE room_id = ?1",
        )?;
        let tickets = stmt.query_map(params![id.to_string()], |row| {
            Ok(Ticket {
                id: parse::parse_uuid(&row.get::<_, String>(0)?)?,
                content: row.get(1)?,
                author_id: row.get(2)?,
                parent_id: parse::parse_uuid_opt(row.get(3)?)?,
                votes: row.get(4)?,
                voter_ids: parse::parse_id_list(&row.get::<_, String>(5)?)?,
                covered: row.get(6)?,
                created_at: parse::parse_datetime(&row.get::<_, String>(7)?)?,
            })
        })?;
        for ticket in tickets {
            let ticket = ticket?;
            room.tickets.insert(ticket.id, ticket);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, content, ticket_id, assignee_ids, created_at
             FROM action_items WHERE room_id = ?1",
        )?;
        let actions = stmt.query_map(params![id.to_string()], |row| {
            Ok(ActionItem {
                id: parse::parse_uuid(&row.get::<_, String>(0)?)?,
                content: row.get(1)?,
                ticket_id: parse::parse_uuid(&row.get::<_, String>(2)?)?,
                assignee_ids: parse::parse_id_list(&row.get::<_, String>(3)?)?,
                created_at: parse::parse_datetime(&row.get::<_, String>(4)?)?,
            })
        })?;
        for action in actions {
            let action = action?;
            room.action_items.insert(action.id, action);
        }

        Ok(Some(room))
    }

    /// Write through the whole aggregate: header update plus delete and
    /// reinsert of all child rows, in one transaction.
    pub fn update(&self, room: &Room) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE rooms SET name = ?1, owner_id = ?2, phase = ?3, votes_per_user = ?4, auto_approve = ?5
             WHERE id = ?6",
            params![
                room.name,
                room.owner_id,
                room.phase.as_str(),
                room.votes_per_user,
                room.auto_approve,
                room.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("room {}", room.id)));
        }
        tx.execute(
            "DELETE FROM participants WHERE room_id = ?1",
            params![room.id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM tickets WHERE room_id = ?1",
            params![room.id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM action_items WHERE room_id = ?1",
            params![room.id.to_string()],
        )?;
        Self::insert_children(&tx, room)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a room; child rows cascade.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.conn
            .execute("DELETE FROM rooms WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// All rooms, headers only.
    pub fn list(&self) -> Result<Vec<Room>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, owner_id, phase, votes_per_user, auto_approve, created_at
             FROM rooms ORDER BY created_at",
        )?;
        let rooms = stmt
            .query_map([], Self::room_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    /// Rooms owned by a user, headers only.
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Room>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, owner_id, phase, votes_per_user, auto_approve, created_at
             FROM rooms WHERE owner_id = ?1 ORDER BY created_at",
        )?;
        let rooms = stmt
            .query_map(params![owner_id], Self::room_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    /// Rooms where the user is an approved participant, headers only.
    pub fn list_by_participant(&self, user_id: &str) -> Result<Vec<Room>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT r.id, r.name, r.owner_id, r.phase, r.votes_per_user, r.auto_approve, r.created_at
             FROM rooms r
             INNER JOIN participants p ON p.room_id = r.id
             WHERE p.user_id = ?1 AND p.status = 'approved'
             ORDER BY r.created_at",
        )?;
        let rooms = stmt
            .query_map(params![user_id], Self::room_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    fn room_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
        Ok(Room {
            id: parse::parse_uuid(&row.get::<_, String>(0)?)?,
            name: row.get(1)?,
            owner_id: row.get(2)?,
            phase: parse::parse_phase(&row.get::<_, String>(3)?)?,
            votes_per_user: row.get(4)?,
            auto_approve: row.get(5)?,
            created_at: parse::parse_datetime(&row.get::<_, String>(6)?)?,
            participants: HashMap::new(),
            pending_participants: HashMap::new(),
            tickets: HashMap::new(),
            action_items: HashMap::new(),
        })
    }

    fn insert_children(conn: &Connection, room: &Room) -> Result<()> {
        for participant in room
            .participants
            .values()
            .chain(room.pending_participants.values())
        {
            conn.execute(
                "INSERT INTO participants (room_id, user_id, user_email, user_name, role, status, votes_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    room.id.to_string(),
                    participant.user.id,
                    participant.user.email,
                    participant.user.name,
                    participant.role.as_str(),
                    participant.status.as_str(),
                    participant.votes_used,
                ],
            )?;
        }

        for ticket in room.tickets.values() {
            let voter_ids = serde_json::to_string(&ticket.voter_ids)?;
            conn.execute(
                "INSERT INTO tickets (id, room_id, content, author_id, parent_id, votes, voter_ids, covered, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ticket.id.to_string(),
                    room.id.to_string(),
                    ticket.content,
                    ticket.author_id,
                    ticket.parent_id.map(|p| p.to_string()),
                    ticket.votes,
                    voter_ids,
                    ticket.covered,
                    ticket.created_at.to_rfc3339(),
                ],
            )?;
        }

        for action in room.action_items.values() {
            let assignee_ids = serde_json::to_string(&action.assignee_ids)?;
            conn.execute(
                "INSERT INTO action_items (id, room_id, content, ticket_id, assignee_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    action.id.to_string(),
                    room.id.to_string(),
                    action.content,
                    action.ticket_id.to_string(),
                    assignee_ids,
                    action.created_at.to_rfc3339(),
                ],
            )?;
        }

        Ok(())
    }
}
