//! Room aggregate and its state transitions
//!
//! A `Room` is a plain in-memory aggregate; the server wraps each loaded
//! room in a read/write lock so that every multi-field transition is
//! applied atomically from the point of view of other tasks. All methods
//! here are synchronous and assume the caller holds the appropriate lock.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use super::{ActionItem, Participant, Role, Status, Ticket, User};

/// Workflow phase of a retrospective. Transitions are moderator-initiated
/// and unrestricted among the five values, backwards included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Ticketing,
    Merging,
    Voting,
    Discussion,
    Summary,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ticketing => "ticketing",
            Phase::Merging => "merging",
            Phase::Voting => "voting",
            Phase::Discussion => "discussion",
            Phase::Summary => "summary",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ticketing" => Ok(Phase::Ticketing),
            "merging" => Ok(Phase::Merging),
            "voting" => Ok(Phase::Voting),
            "discussion" => Ok(Phase::Discussion),
            "summary" => Ok(Phase::Summary),
            other => Err(Error::InvalidArgument(format!("unknown phase: {other}"))),
        }
    }
}

/// Result of a vote or unvote, broadcast to the room.
#[derive(Debug, Clone, Serialize)]
pub struct VoteTally {
    pub ticket_id: Uuid,
    pub votes: u32,
    pub voter_ids: Vec<String>,
    pub user_id: String,
    pub votes_used: u32,
}

/// A retrospective room: the aggregate root owning participants, tickets
/// and action items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub owner_id: String,
    pub phase: Phase,
    pub votes_per_user: u32,
    pub auto_approve: bool,
    pub participants: HashMap<String, Participant>,
    pub pending_participants: HashMap<String, Participant>,
    pub tickets: HashMap<Uuid, Ticket>,
    pub action_items: HashMap<Uuid, ActionItem>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(name: String, owner_id: String, votes_per_user: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            owner_id,
            phase: Phase::Ticketing,
            votes_per_user,
            auto_approve: false,
            participants: HashMap::new(),
            pending_participants: HashMap::new(),
            tickets: HashMap::new(),
            action_items: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Approved participant, if any.
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    /// Pending participant, if any.
    pub fn pending(&self, user_id: &str) -> Option<&Participant> {
        self.pending_participants.get(user_id)
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id) || self.pending_participants.contains_key(user_id)
    }

    pub fn is_moderator_or_owner(&self, user_id: &str) -> bool {
        self.participants
            .get(user_id)
            .is_some_and(|p| p.role.is_moderator())
    }

    pub fn ticket(&self, id: Uuid) -> Option<&Ticket> {
        self.tickets.get(&id)
    }

    /// Tickets that are valid merge targets, oldest first.
    pub fn root_tickets(&self) -> Vec<Ticket> {
        let mut roots: Vec<Ticket> = self
            .tickets
            .values()
            .filter(|t| t.is_root())
            .cloned()
            .collect();
        roots.sort_by_key(|t| t.created_at);
        roots
    }

    /// Add a user to the room. Idempotent on user id: a user already known
    /// to the room, approved or pending, is returned unchanged.
    pub fn add_participant(&mut self, user: User, role: Role, status: Status) -> Participant {
        let key = user.id.clone();
        if let Some(existing) = self.participants.get(&key) {
            return existing.clone();
        }
        if let Some(existing) = self.pending_participants.get(&key) {
            return existing.clone();
        }
        let participant = Participant::new(user, role, status);
        match status {
            Status::Approved => self.participants.insert(key, participant.clone()),
            Status::Pending => self.pending_participants.insert(key, participant.clone()),
        };
        participant
    }

    /// Move a pending participant to the approved set.
    pub fn approve_participant(&mut self, user_id: &str) -> Result<Participant> {
        let mut participant = self
            .pending_participants
            .remove(user_id)
            .ok_or_else(|| Error::NotFound(format!("no pending participant {user_id}")))?;
        participant.status = Status::Approved;
        participant.votes_used = 0;
        self.participants
            .insert(user_id.to_owned(), participant.clone());
        Ok(participant)
    }

    /// Drop a pending participant without admitting them.
    pub fn reject_participant(&mut self, user_id: &str) -> Result<()> {
        self.pending_participants
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no pending participant {user_id}")))
    }

    /// Remove a participant from either set. The owner is immovable.
    /// The removed user's votes are withdrawn so that voter lists only
    /// ever name current members.
    pub fn remove_participant(&mut self, user_id: &str) -> Result<()> {
        if user_id == self.owner_id {
            return Err(Error::PermissionDenied("the room owner cannot be removed".into()));
        }
        let removed = self
            .participants
            .remove(user_id)
            .or_else(|| self.pending_participants.remove(user_id));
        if removed.is_none() {
            return Err(Error::NotFound(format!("participant {user_id}")));
        }
        for ticket in self.tickets.values_mut() {
            if let Some(pos) = ticket.voter_ids.iter().position(|v| v == user_id) {
                ticket.voter_ids.remove(pos);
                ticket.votes = ticket.votes.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Change an approved participant's role. The owner's role is fixed
    /// and the owner role itself cannot be granted.
    pub fn set_role(&mut self, user_id: &str, role: Role) -> Result<()> {
        if role == Role::Owner {
            return Err(Error::InvalidArgument("the owner role cannot be granted".into()));
        }
        if user_id == self.owner_id {
            return Err(Error::PermissionDenied("the owner's role is fixed".into()));
        }
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("participant {user_id}")))?;
        participant.role = role;
        Ok(())
    }

    pub fn set_auto_approve(&mut self, auto_approve: bool) {
        self.auto_approve = auto_approve;
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Insert a freshly created ticket. New tickets always start as roots.
    pub fn add_ticket(&mut self, ticket: Ticket) -> Result<Ticket> {
        if ticket.parent_id.is_some() {
            return Err(Error::InvalidArgument("new tickets cannot start merged".into()));
        }
        if ticket.content.trim().is_empty() {
            return Err(Error::InvalidArgument("ticket content must not be empty".into()));
        }
        let out = ticket.clone();
        self.tickets.insert(ticket.id, ticket);
        Ok(out)
    }

    /// Update a ticket's content and/or its merge parent.
    ///
    /// `parent` distinguishes "leave unchanged" (`None`) from "detach"
    /// (`Some(None)`) and "merge under" (`Some(Some(id))`). A merge target
    /// must be an existing root other than the ticket itself, and a ticket
    /// that already has children cannot become a child; merges stay a
    /// forest of depth one.
    pub fn edit_ticket(
        &mut self,
        id: Uuid,
        content: Option<String>,
        parent: Option<Option<Uuid>>,
    ) -> Result<Ticket> {
        if !self.tickets.contains_key(&id) {
            return Err(Error::NotFound(format!("ticket {id}")));
        }
        if let Some(new_content) = &content {
            if new_content.trim().is_empty() {
                return Err(Error::InvalidArgument("ticket content must not be empty".into()));
            }
        }
        if let Some(Some(parent_id)) = parent {
            if parent_id == id {
                return Err(Error::InvalidArgument("a ticket cannot be merged into itself".into()));
            }
            let target = self
                .tickets
                .get(&parent_id)
                .ok_or_else(|| Error::NotFound(format!("ticket {parent_id}")))?;
            if !target.is_root() {
                return Err(Error::InvalidArgument(
                    "merge target is itself merged into another ticket".into(),
                ));
            }
            if self.tickets.values().any(|t| t.parent_id == Some(id)) {
                return Err(Error::InvalidArgument(
                    "a ticket with merged children cannot become a child".into(),
                ));
            }
        }
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))?;
        if let Some(new_content) = content {
            ticket.content = new_content;
        }
        if let Some(change) = parent {
            ticket.parent_id = change;
        }
        Ok(ticket.clone())
    }

    /// Delete a ticket. Children merged under it become roots again and
    /// are returned so the caller can announce them; votes spent on the
    /// deleted ticket are refunded to their owners.
    pub fn delete_ticket(&mut self, id: Uuid) -> Result<Vec<Uuid>> {
        let removed = self
            .tickets
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))?;
        for voter in &removed.voter_ids {
            if let Some(participant) = self.participants.get_mut(voter) {
                participant.votes_used = participant.votes_used.saturating_sub(1);
            }
        }
        let mut detached = Vec::new();
        for ticket in self.tickets.values_mut() {
            if ticket.parent_id == Some(id) {
                ticket.parent_id = None;
                detached.push(ticket.id);
            }
        }
        Ok(detached)
    }

    pub fn mark_covered(&mut self, id: Uuid, covered: bool) -> Result<Ticket> {
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))?;
        ticket.covered = covered;
        Ok(ticket.clone())
    }

    /// Spend one of the user's votes on a root ticket. Both the ticket's
    /// tally and the participant's counter move together.
    pub fn vote(&mut self, user_id: &str, ticket_id: Uuid) -> Result<VoteTally> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| Error::NotFound(format!("participant {user_id}")))?;
        let ticket = self
            .tickets
            .get(&ticket_id)
            .ok_or_else(|| Error::NotFound(format!("ticket {ticket_id}")))?;
        if !ticket.is_root() {
            return Err(Error::InvalidArgument("merged tickets cannot be voted on".into()));
        }
        if ticket.voter_ids.iter().any(|v| v == user_id) {
            return Err(Error::QuotaExceeded("already voted on this ticket".into()));
        }
        if participant.votes_used >= self.votes_per_user {
            return Err(Error::QuotaExceeded("no votes left".into()));
        }
        let ticket = self
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| Error::NotFound(format!("ticket {ticket_id}")))?;
        ticket.votes += 1;
        ticket.voter_ids.push(user_id.to_owned());
        let votes = ticket.votes;
        let voter_ids = ticket.voter_ids.clone();
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("participant {user_id}")))?;
        participant.votes_used += 1;
        Ok(VoteTally {
            ticket_id,
            votes,
            voter_ids,
            user_id: user_id.to_owned(),
            votes_used: participant.votes_used,
        })
    }

    /// Withdraw a previously cast vote.
    pub fn unvote(&mut self, user_id: &str, ticket_id: Uuid) -> Result<VoteTally> {
        if !self.participants.contains_key(user_id) {
            return Err(Error::NotFound(format!("participant {user_id}")));
        }
        let ticket = self
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| Error::NotFound(format!("ticket {ticket_id}")))?;
        let Some(pos) = ticket.voter_ids.iter().position(|v| v == user_id) else {
            return Err(Error::InvalidArgument("no vote to withdraw".into()));
        };
        ticket.voter_ids.remove(pos);
        ticket.votes = ticket.votes.saturating_sub(1);
        let votes = ticket.votes;
        let voter_ids = ticket.voter_ids.clone();
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("participant {user_id}")))?;
        participant.votes_used = participant.votes_used.saturating_sub(1);
        Ok(VoteTally {
            ticket_id,
            votes,
            voter_ids,
            user_id: user_id.to_owned(),
            votes_used: participant.votes_used,
        })
    }

    /// Record a follow-up task. The referenced ticket must exist.
    pub fn add_action_item(&mut self, action: ActionItem) -> Result<ActionItem> {
        if action.content.trim().is_empty() {
            return Err(Error::InvalidArgument("action content must not be empty".into()));
        }
        if !self.tickets.contains_key(&action.ticket_id) {
            return Err(Error::NotFound(format!("ticket {}", action.ticket_id)));
        }
        let out = action.clone();
        self.action_items.insert(action.id, action);
        Ok(out)
    }

    pub fn delete_action_item(&mut self, id: Uuid) -> Result<()> {
        self.action_items
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("action {id}")))
    }
}
