//! Wire protocol message types
//!
//! Every frame, inbound or outbound, is JSON of the shape
//! `{"type": string, "payload": object}`. Inbound frames keep their
//! payload as a free-form map so the router can report a missing field as
//! a bad argument rather than an undecodable message; outbound frames are
//! a tagged enum serialized in one place.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use huddle_core::{ActionItem, Participant, Phase, Role, Room, Ticket, User, VoteTally};

/// An inbound frame: a type tag plus a payload map.
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Error kinds surfaced to clients in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    NotApproved,
    WrongPhase,
    NotAuthorized,
    NotFound,
    InvalidArgument,
    QuotaExceeded,
    SuggesterUnavailable,
    SuggesterFailed,
    PersistenceFailed,
}

impl ErrorCode {
    /// Map a domain failure onto its wire code.
    pub fn from_domain(err: &huddle_core::Error) -> Self {
        match err {
            huddle_core::Error::NotFound(_) => ErrorCode::NotFound,
            huddle_core::Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            huddle_core::Error::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            huddle_core::Error::PermissionDenied(_) => ErrorCode::NotAuthorized,
            huddle_core::Error::Database(_) | huddle_core::Error::Serialization(_) => {
                ErrorCode::PersistenceFailed
            }
        }
    }
}

/// Snapshot of a room pushed in `room_state` frames.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStateView {
    pub id: Uuid,
    pub name: String,
    pub phase: Phase,
    pub votes_per_user: u32,
    pub auto_approve: bool,
    pub participants: HashMap<String, Participant>,
    pub pending_participants: HashMap<String, Participant>,
    pub tickets: HashMap<Uuid, Ticket>,
    pub action_items: HashMap<Uuid, ActionItem>,
}

impl RoomStateView {
    /// Everything an approved participant may see.
    pub fn full(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            phase: room.phase,
            votes_per_user: room.votes_per_user,
            auto_approve: room.auto_approve,
            participants: room.participants.clone(),
            pending_participants: room.pending_participants.clone(),
            tickets: room.tickets.clone(),
            action_items: room.action_items.clone(),
        }
    }

    /// What a pending user may see: the room's name, phase and vote quota,
    /// nothing in-room.
    pub fn pending(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            phase: room.phase,
            votes_per_user: room.votes_per_user,
            auto_approve: room.auto_approve,
            participants: HashMap::new(),
            pending_participants: HashMap::new(),
            tickets: HashMap::new(),
            action_items: HashMap::new(),
        }
    }
}

/// Outbound frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomState(RoomStateView),
    UserJoined { user: User },
    UserLeft { user_id: String },
    TicketAdded { ticket: Ticket },
    TicketUpdated { ticket: Ticket },
    TicketDeleted { ticket_id: Uuid },
    VoteUpdated(VoteTally),
    ActionAdded { action: ActionItem },
    ActionDeleted { action_id: Uuid },
    PhaseChanged { phase: Phase },
    RoleChanged { user_id: String, role: Role },
    UserRemoved { user_id: String },
    ParticipantPending { participant: Participant },
    ParticipantApproved { user_id: String, participant: Participant },
    ParticipantRejected { user_id: String },
    AutoApproveChanged { auto_approve: bool },
    AutoMergeProgress { status: String },
    AutoMergeComplete { merges_applied: usize, groups_count: usize },
    AutoProposeProgress { status: String },
    AutoProposeComplete { actions_created: usize },
    Error { code: ErrorCode, message: String },
}

/// Distinguishes an absent field from an explicit `null`, so that
/// `edit_ticket` can treat `"parent_id": null` as a detach request while
/// leaving the parent untouched when the field is missing.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct AddTicketPayload {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct EditTicketPayload {
    pub ticket_id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub parent_id: Option<Option<Uuid>>,
}

#[derive(Debug, Deserialize)]
pub struct TicketRefPayload {
    pub ticket_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MarkCoveredPayload {
    pub ticket_id: Uuid,
    pub covered: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddActionPayload {
    pub content: String,
    pub ticket_id: Uuid,
    #[serde(default)]
    pub assignee_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActionRefPayload {
    pub action_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SetPhasePayload {
    pub phase: String,
}

#[derive(Debug, Deserialize)]
pub struct SetRolePayload {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct UserRefPayload {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetAutoApprovePayload {
    pub auto_approve: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProposeActionsPayload {
    #[serde(default)]
    pub team_context: String,
}
