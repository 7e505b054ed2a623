//! Message router
//!
//! Validates and applies every client-initiated mutation. Per frame: gate
//! on approved membership, authorize against the role and phase matrix,
//! apply the domain operation under the room's write lock, write the whole
//! aggregate through the repository, then fan the resulting event out with
//! the appropriate filter. Rejections at any step go back to the sender
//! alone as an `error` frame.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use huddle_core::{
    invariants, ActionItem, Error as DomainError, Phase, Role, Room, RoomRepository, Status,
    Ticket, User,
};

use crate::bus::Bus;
use crate::connection::Client;
use crate::hub::{Filter, Hub};
use crate::protocol::{self, ErrorCode, Frame, RoomStateView, ServerMessage};
use crate::registry::{RoomRegistry, SharedRoom};
use crate::suggester::Suggester;

/// Marker prefixed to AI-proposed action items so clients can badge them.
const SUGGESTED_PREFIX: &str = "\u{1f916} ";

/// A rejected frame, reported to the sender only.
#[derive(Debug)]
pub struct Reject {
    pub code: ErrorCode,
    pub message: String,
}

impl Reject {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<DomainError> for Reject {
    fn from(err: DomainError) -> Self {
        Reject {
            code: ErrorCode::from_domain(&err),
            message: err.to_string(),
        }
    }
}

type HandlerResult = Result<(), Reject>;

/// The collaboration engine: repository, room cache, hub and the optional
/// bus and suggester, wired together at startup.
pub struct Router {
    pub repo: Arc<dyn RoomRepository>,
    pub registry: Arc<RoomRegistry>,
    pub hub: Hub,
    pub bus: Option<Bus>,
    pub suggester: Option<Arc<dyn Suggester>>,
}

impl Router {
    pub fn new(repo: Arc<dyn RoomRepository>, registry: Arc<RoomRegistry>, hub: Hub) -> Self {
        Self {
            repo,
            registry,
            hub,
            bus: None,
            suggester: None,
        }
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_suggester(mut self, suggester: Arc<dyn Suggester>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    /// Join protocol, run once per connection before any inbound frame is
    /// processed. Pushes the appropriate room state view to the new client
    /// and announces the membership to the room.
    pub async fn join(&self, client: &Client, user: &User) {
        let room_ref = match self.registry.get(client.room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                client.send(&ServerMessage::Error {
                    code: ErrorCode::NotFound,
                    message: "room not found".into(),
                });
                return;
            }
            Err(err) => {
                warn!(error = %err, room_id = %client.room_id, "failed to load room on join");
                client.send(&ServerMessage::Error {
                    code: ErrorCode::PersistenceFailed,
                    message: "failed to load room".into(),
                });
                return;
            }
        };

        let mut inserted = false;
        let (snapshot, state, announce) = {
            let mut room = room_ref.write().await;
            if room.participant(&user.id).is_some() {
                (
                    room.clone(),
                    RoomStateView::full(&room),
                    ServerMessage::UserJoined { user: user.clone() },
                )
            } else if let Some(pending) = room.pending(&user.id) {
                let participant = pending.clone();
                (
                    room.clone(),
                    RoomStateView::pending(&room),
                    ServerMessage::ParticipantPending { participant },
                )
            } else {
                let status = if room.auto_approve {
                    Status::Approved
                } else {
                    Status::Pending
                };
                let participant = room.add_participant(user.clone(), Role::Participant, status);
                inserted = true;
                let (state, announce) = match status {
                    Status::Approved => (
                        RoomStateView::full(&room),
                        ServerMessage::UserJoined { user: user.clone() },
                    ),
                    Status::Pending => (
                        RoomStateView::pending(&room),
                        ServerMessage::ParticipantPending { participant },
                    ),
                };
                (room.clone(), state, announce)
            }
        };

        if inserted {
            // membership in memory stands even if the write fails; the
            // next successful update repairs the stored copy
            if let Err(err) = self.repo.update(&snapshot) {
                warn!(error = %err, room_id = %snapshot.id, "failed to persist join");
            }
        }

        client.send(&ServerMessage::RoomState(state));
        self.broadcast(snapshot.id, &announce, Filter::All).await;
    }

    /// Connection teardown: unregister and tell the room.
    pub async fn leave(&self, client: &Client) {
        self.hub.unregister(client.room_id, client.id).await;
        self.broadcast(
            client.room_id,
            &ServerMessage::UserLeft {
                user_id: client.user_id.clone(),
            },
            Filter::All,
        )
        .await;
    }

    /// Entry point for one inbound frame.
    pub async fn handle_frame(&self, client: &Client, raw: &str) {
        let frame: Frame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "undecodable frame");
                self.reply_error(
                    client,
                    Reject::new(ErrorCode::InvalidMessage, "invalid message format"),
                );
                return;
            }
        };
        if let Err(reject) = self.dispatch(client, &frame).await {
            self.reply_error(client, reject);
        }
    }

    fn reply_error(&self, client: &Client, reject: Reject) {
        client.send(&ServerMessage::Error {
            code: reject.code,
            message: reject.message,
        });
    }

    async fn dispatch(&self, client: &Client, frame: &Frame) -> HandlerResult {
        let room_ref = self.load_room(client.room_id).await?;

        // every typed mutation requires an approved sender; pending users
        // receive pushed state only
        {
            let room = room_ref.read().await;
            if room.participant(&client.user_id).is_none() {
                return Err(Reject::new(
                    ErrorCode::NotApproved,
                    "you must be approved to perform actions",
                ));
            }
        }

        match frame.kind.as_str() {
            "add_ticket" => self.add_ticket(client, &room_ref, &frame.payload).await,
            "edit_ticket" => self.edit_ticket(client, &room_ref, &frame.payload).await,
            "delete_ticket" => self.delete_ticket(client, &room_ref, &frame.payload).await,
            "mark_covered" => self.mark_covered(client, &room_ref, &frame.payload).await,
            "vote" => self.vote(client, &room_ref, &frame.payload).await,
            "unvote" => self.unvote(client, &room_ref, &frame.payload).await,
            "add_action" => self.add_action(client, &room_ref, &frame.payload).await,
            "delete_action" => self.delete_action(client, &room_ref, &frame.payload).await,
            "set_phase" => self.set_phase(client, &room_ref, &frame.payload).await,
            "set_role" => self.set_role(client, &room_ref, &frame.payload).await,
            "remove_user" => self.remove_user(client, &room_ref, &frame.payload).await,
            "approve_participant" => {
                self.approve_participant(client, &room_ref, &frame.payload)
                    .await
            }
            "reject_participant" => {
                self.reject_participant(client, &room_ref, &frame.payload)
                    .await
            }
            "set_auto_approve" => {
                self.set_auto_approve(client, &room_ref, &frame.payload)
                    .await
            }
            "auto_merge" => self.auto_merge(client, &room_ref).await,
            "auto_propose_actions" => {
                self.auto_propose_actions(client, &room_ref, &frame.payload)
                    .await
            }
            other => Err(Reject::new(
                ErrorCode::InvalidMessage,
                format!("unknown message type: {other}"),
            )),
        }
    }

    async fn load_room(&self, room_id: Uuid) -> Result<SharedRoom, Reject> {
        match self.registry.get(room_id).await {
            Ok(Some(room)) => Ok(room),
            Ok(None) => Err(Reject::new(ErrorCode::NotFound, "room not found")),
            Err(err) => {
                warn!(error = %err, room_id = %room_id, "failed to load room");
                Err(Reject::new(ErrorCode::PersistenceFailed, "failed to load room"))
            }
        }
    }

    fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, Reject> {
        serde_json::from_value(payload.clone())
            .map_err(|err| Reject::new(ErrorCode::InvalidArgument, format!("bad payload: {err}")))
    }

    fn require_phase(room: &Room, allowed: &[Phase]) -> HandlerResult {
        if allowed.contains(&room.phase) {
            Ok(())
        } else {
            Err(Reject::new(
                ErrorCode::WrongPhase,
                format!("not allowed in the {} phase", room.phase),
            ))
        }
    }

    fn require_moderator(room: &Room, user_id: &str) -> HandlerResult {
        if room.is_moderator_or_owner(user_id) {
            Ok(())
        } else {
            Err(Reject::new(ErrorCode::NotAuthorized, "moderator role required"))
        }
    }

    fn require_owner(room: &Room, user_id: &str) -> HandlerResult {
        if room.owner_id == user_id {
            Ok(())
        } else {
            Err(Reject::new(
                ErrorCode::NotAuthorized,
                "only the room owner can do that",
            ))
        }
    }

    /// Write the mutated aggregate through before anything is broadcast.
    fn persist(&self, snapshot: &Room) -> HandlerResult {
        invariants::assert_room_invariants(snapshot);
        self.repo.update(snapshot).map_err(|err| {
            warn!(error = %err, room_id = %snapshot.id, "failed to persist room");
            Reject::new(ErrorCode::PersistenceFailed, "failed to save changes")
        })
    }

    /// Local fan-out plus mirroring onto the bus when configured.
    async fn broadcast(&self, room_id: Uuid, msg: &ServerMessage, filter: Filter) {
        let frame = match serde_json::to_string(msg) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast frame");
                return;
            }
        };
        let approved = self.registry.approved_users(room_id).await;
        self.hub
            .local_broadcast(room_id, &frame, &filter, &approved)
            .await;
        if let Some(bus) = &self.bus {
            bus.publish(room_id, &frame, &filter).await;
        }
    }

    async fn add_ticket(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::AddTicketPayload = Self::parse(payload)?;
        let (snapshot, ticket) = {
            let mut room = room_ref.write().await;
            Self::require_phase(&room, &[Phase::Ticketing])?;
            let ticket = room.add_ticket(Ticket::new(req.content, client.user_id.clone()))?;
            (room.clone(), ticket)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::TicketAdded { ticket },
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn edit_ticket(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::EditTicketPayload = Self::parse(payload)?;
        let (snapshot, ticket) = {
            let mut room = room_ref.write().await;
            Self::require_ticket_authority(&room, req.ticket_id, &client.user_id)?;
            let ticket = room.edit_ticket(req.ticket_id, req.content, req.parent_id)?;
            (room.clone(), ticket)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::TicketUpdated { ticket },
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    /// Tickets may be edited or deleted by their author or by a moderator.
    fn require_ticket_authority(room: &Room, ticket_id: Uuid, user_id: &str) -> HandlerResult {
        let ticket = room
            .ticket(ticket_id)
            .ok_or_else(|| Reject::new(ErrorCode::NotFound, "ticket not found"))?;
        if ticket.author_id != user_id && !room.is_moderator_or_owner(user_id) {
            return Err(Reject::new(
                ErrorCode::NotAuthorized,
                "not authorized to change this ticket",
            ));
        }
        Ok(())
    }

    async fn delete_ticket(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::TicketRefPayload = Self::parse(payload)?;
        let (snapshot, detached) = {
            let mut room = room_ref.write().await;
            Self::require_ticket_authority(&room, req.ticket_id, &client.user_id)?;
            let detached = room.delete_ticket(req.ticket_id)?;
            (room.clone(), detached)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::TicketDeleted {
                ticket_id: req.ticket_id,
            },
            Filter::ApprovedOnly,
        )
        .await;
        // children of the deleted ticket became roots again
        for child_id in detached {
            if let Some(ticket) = snapshot.ticket(child_id) {
                self.broadcast(
                    snapshot.id,
                    &ServerMessage::TicketUpdated {
                        ticket: ticket.clone(),
                    },
                    Filter::ApprovedOnly,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn mark_covered(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::MarkCoveredPayload = Self::parse(payload)?;
        let (snapshot, ticket) = {
            let mut room = room_ref.write().await;
            Self::require_phase(&room, &[Phase::Discussion, Phase::Summary])?;
            Self::require_moderator(&room, &client.user_id)?;
            let ticket = room.mark_covered(req.ticket_id, req.covered)?;
            (room.clone(), ticket)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::TicketUpdated { ticket },
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn vote(&self, client: &Client, room_ref: &SharedRoom, payload: &Value) -> HandlerResult {
        let req: protocol::TicketRefPayload = Self::parse(payload)?;
        let (snapshot, tally) = {
            let mut room = room_ref.write().await;
            Self::require_phase(&room, &[Phase::Voting])?;
            let tally = room.vote(&client.user_id, req.ticket_id)?;
            (room.clone(), tally)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::VoteUpdated(tally),
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn unvote(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::TicketRefPayload = Self::parse(payload)?;
        let (snapshot, tally) = {
            let mut room = room_ref.write().await;
            Self::require_phase(&room, &[Phase::Voting])?;
            let tally = room.unvote(&client.user_id, req.ticket_id)?;
            (room.clone(), tally)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::VoteUpdated(tally),
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn add_action(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::AddActionPayload = Self::parse(payload)?;
        let (snapshot, action) = {
            let mut room = room_ref.write().await;
            Self::require_phase(&room, &[Phase::Discussion])?;
            Self::require_moderator(&room, &client.user_id)?;
            let action = room.add_action_item(ActionItem::new(
                req.content,
                req.ticket_id,
                req.assignee_ids,
            ))?;
            (room.clone(), action)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::ActionAdded { action },
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn delete_action(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::ActionRefPayload = Self::parse(payload)?;
        let snapshot = {
            let mut room = room_ref.write().await;
            Self::require_phase(&room, &[Phase::Discussion])?;
            Self::require_moderator(&room, &client.user_id)?;
            room.delete_action_item(req.action_id)?;
            room.clone()
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::ActionDeleted {
                action_id: req.action_id,
            },
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn set_phase(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::SetPhasePayload = Self::parse(payload)?;
        let phase: Phase = req.phase.parse().map_err(Reject::from)?;
        let snapshot = {
            let mut room = room_ref.write().await;
            Self::require_moderator(&room, &client.user_id)?;
            room.set_phase(phase);
            room.clone()
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::PhaseChanged { phase },
            Filter::ApprovedOnly,
        )
        .await;
        Ok(())
    }

    async fn set_role(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::SetRolePayload = Self::parse(payload)?;
        let role: Role = req.role.parse().map_err(Reject::from)?;
        let snapshot = {
            let mut room = room_ref.write().await;
            Self::require_owner(&room, &client.user_id)?;
            room.set_role(&req.user_id, role)?;
            room.clone()
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::RoleChanged {
                user_id: req.user_id,
                role,
            },
            Filter::All,
        )
        .await;
        Ok(())
    }

    async fn remove_user(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::UserRefPayload = Self::parse(payload)?;
        let snapshot = {
            let mut room = room_ref.write().await;
            Self::require_moderator(&room, &client.user_id)?;
            room.remove_participant(&req.user_id)?;
            room.clone()
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::UserRemoved {
                user_id: req.user_id,
            },
            Filter::All,
        )
        .await;
        Ok(())
    }

    async fn approve_participant(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::UserRefPayload = Self::parse(payload)?;
        let (snapshot, participant) = {
            let mut room = room_ref.write().await;
            Self::require_moderator(&room, &client.user_id)?;
            let participant = room.approve_participant(&req.user_id)?;
            (room.clone(), participant)
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::ParticipantApproved {
                user_id: req.user_id.clone(),
                participant,
            },
            Filter::All,
        )
        .await;
        // the freshly approved user finally gets the real room
        self.broadcast(
            snapshot.id,
            &ServerMessage::RoomState(RoomStateView::full(&snapshot)),
            Filter::OnlyUser(req.user_id),
        )
        .await;
        Ok(())
    }

    async fn reject_participant(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::UserRefPayload = Self::parse(payload)?;
        let snapshot = {
            let mut room = room_ref.write().await;
            Self::require_moderator(&room, &client.user_id)?;
            room.reject_participant(&req.user_id)?;
            room.clone()
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::ParticipantRejected {
                user_id: req.user_id,
            },
            Filter::All,
        )
        .await;
        Ok(())
    }

    async fn set_auto_approve(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::SetAutoApprovePayload = Self::parse(payload)?;
        let snapshot = {
            let mut room = room_ref.write().await;
            Self::require_moderator(&room, &client.user_id)?;
            room.set_auto_approve(req.auto_approve);
            room.clone()
        };
        self.persist(&snapshot)?;
        self.broadcast(
            snapshot.id,
            &ServerMessage::AutoApproveChanged {
                auto_approve: req.auto_approve,
            },
            Filter::All,
        )
        .await;
        Ok(())
    }

    async fn auto_merge(&self, client: &Client, room_ref: &SharedRoom) -> HandlerResult {
        {
            let room = room_ref.read().await;
            Self::require_moderator(&room, &client.user_id)?;
            Self::require_phase(&room, &[Phase::Merging])?;
        }
        let Some(suggester) = self.suggester.clone() else {
            return Err(Reject::new(
                ErrorCode::SuggesterUnavailable,
                "suggestion service not configured",
            ));
        };

        client.send(&ServerMessage::AutoMergeProgress {
            status: "analyzing".into(),
        });

        let roots = room_ref.read().await.root_tickets();
        let groups = suggester.suggest_merges(&roots).await.map_err(|err| {
            warn!(error = %err, "merge suggestion failed");
            Reject::new(ErrorCode::SuggesterFailed, format!("auto-merge failed: {err}"))
        })?;
        let groups_count = groups.len();

        let (snapshot, updated) = {
            let mut room = room_ref.write().await;
            let mut updated = Vec::new();
            for group in &groups {
                // the room may have moved on while the suggester was
                // thinking; only merges that are still valid are applied
                if !room
                    .ticket(group.parent_ticket_id)
                    .is_some_and(Ticket::is_root)
                {
                    debug!(parent = %group.parent_ticket_id, "skipping merge group, parent is not a root");
                    continue;
                }
                for child_id in &group.child_ticket_ids {
                    if !room.ticket(*child_id).is_some_and(Ticket::is_root) {
                        debug!(child = %child_id, "skipping merge child, not a root");
                        continue;
                    }
                    match room.edit_ticket(*child_id, None, Some(Some(group.parent_ticket_id))) {
                        Ok(ticket) => updated.push(ticket),
                        Err(err) => debug!(child = %child_id, error = %err, "skipping merge child"),
                    }
                }
            }
            (room.clone(), updated)
        };

        self.persist(&snapshot)?;
        let merges_applied = updated.len();
        for ticket in updated {
            self.broadcast(
                snapshot.id,
                &ServerMessage::TicketUpdated { ticket },
                Filter::ApprovedOnly,
            )
            .await;
        }
        client.send(&ServerMessage::AutoMergeComplete {
            merges_applied,
            groups_count,
        });
        Ok(())
    }

    async fn auto_propose_actions(
        &self,
        client: &Client,
        room_ref: &SharedRoom,
        payload: &Value,
    ) -> HandlerResult {
        let req: protocol::ProposeActionsPayload = Self::parse(payload)?;
        {
            let room = room_ref.read().await;
            Self::require_moderator(&room, &client.user_id)?;
            Self::require_phase(&room, &[Phase::Discussion])?;
        }
        let Some(suggester) = self.suggester.clone() else {
            return Err(Reject::new(
                ErrorCode::SuggesterUnavailable,
                "suggestion service not configured",
            ));
        };

        client.send(&ServerMessage::AutoProposeProgress {
            status: "analyzing".into(),
        });

        let roots = room_ref.read().await.root_tickets();
        let proposals = suggester
            .propose_actions(&roots, &req.team_context)
            .await
            .map_err(|err| {
                warn!(error = %err, "action proposal failed");
                Reject::new(
                    ErrorCode::SuggesterFailed,
                    format!("auto-propose actions failed: {err}"),
                )
            })?;

        let (snapshot, created) = {
            let mut room = room_ref.write().await;
            let mut created = Vec::new();
            for proposal in proposals {
                let action = ActionItem::new(
                    format!("{SUGGESTED_PREFIX}{}", proposal.content),
                    proposal.ticket_id,
                    Vec::new(),
                );
                match room.add_action_item(action) {
                    Ok(action) => created.push(action),
                    Err(err) => {
                        debug!(ticket = %proposal.ticket_id, error = %err, "skipping proposed action")
                    }
                }
            }
            (room.clone(), created)
        };

        self.persist(&snapshot)?;
        let actions_created = created.len();
        for action in created {
            self.broadcast(
                snapshot.id,
                &ServerMessage::ActionAdded { action },
                Filter::ApprovedOnly,
            )
            .await;
        }
        client.send(&ServerMessage::AutoProposeComplete { actions_created });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use huddle_core::Database;
    use crate::suggester::{MergeGroup, ProposedAction, SuggestError};

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: id.to_string(),
        }
    }

    fn new_router() -> Router {
        let repo: Arc<dyn RoomRepository> = Arc::new(Database::open_in_memory().unwrap());
        Router::new(repo.clone(), Arc::new(RoomRegistry::new(repo)), Hub::start())
    }

    fn create_room(router: &Router, owner: &str, votes_per_user: u32) -> Uuid {
        let mut room = Room::new("Retro".into(), owner.into(), votes_per_user);
        room.add_participant(user(owner), Role::Owner, Status::Approved);
        router.repo.create(&room).unwrap();
        room.id
    }

    struct TestClient {
        client: Client,
        rx: mpsc::Receiver<String>,
    }

    impl TestClient {
        async fn connect(router: &Router, room_id: Uuid, id: &str) -> Self {
            let (client, rx) = Client::new(id.to_string(), room_id);
            router.hub.register(client.clone()).await;
            let test_client = Self { client, rx };
            router.join(&test_client.client, &user(id)).await;
            test_client
        }

        async fn send(&self, router: &Router, kind: &str, payload: Value) {
            let raw = json!({"type": kind, "payload": payload}).to_string();
            router.handle_frame(&self.client, &raw).await;
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(serde_json::from_str(&frame).unwrap());
            }
            frames
        }
    }

    fn kinds(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
    }

    fn error_codes(frames: &[Value]) -> Vec<&str> {
        frames
            .iter()
            .filter(|f| f["type"] == "error")
            .map(|f| f["payload"]["code"].as_str().unwrap())
            .collect()
    }

    async fn ticket_id_by_content(router: &Router, room_id: Uuid, content: &str) -> Uuid {
        let room = router.registry.get(room_id).await.unwrap().unwrap();
        let room = room.read().await;
        room.tickets
            .values()
            .find(|t| t.content == content)
            .unwrap_or_else(|| panic!("no ticket with content {content}"))
            .id
    }

    #[tokio::test]
    async fn join_pushes_pending_state_and_announces() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;

        let bob_frames = bob.drain();
        assert_eq!(bob_frames[0]["type"], "room_state");
        assert_eq!(bob_frames[0]["payload"]["phase"], "ticketing");
        assert_eq!(bob_frames[0]["payload"]["votes_per_user"], 3);
        // pending view reveals nothing in-room
        assert!(bob_frames[0]["payload"]["tickets"]
            .as_object()
            .unwrap()
            .is_empty());
        assert!(bob_frames[0]["payload"]["participants"]
            .as_object()
            .unwrap()
            .is_empty());

        let alice_frames = alice.drain();
        assert!(kinds(&alice_frames).contains(&"participant_pending"));
    }

    #[tokio::test]
    async fn approval_delivers_full_state_to_the_target() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        alice.drain();
        bob.drain();

        alice
            .send(&router, "approve_participant", json!({"user_id": "bob"}))
            .await;

        let bob_frames = bob.drain();
        assert!(kinds(&bob_frames).contains(&"participant_approved"));
        let state = bob_frames
            .iter()
            .find(|f| f["type"] == "room_state")
            .expect("approved user should get the full room state");
        assert!(state["payload"]["participants"]
            .as_object()
            .unwrap()
            .contains_key("bob"));

        let alice_frames = alice.drain();
        assert!(kinds(&alice_frames).contains(&"participant_approved"));
        // the room_state push targets bob's connections only
        assert!(!kinds(&alice_frames).contains(&"room_state"));
    }

    #[tokio::test]
    async fn rejected_participant_is_dropped() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        bob.drain();

        alice
            .send(&router, "reject_participant", json!({"user_id": "bob"}))
            .await;

        assert!(kinds(&bob.drain()).contains(&"participant_rejected"));
        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert!(!stored.is_member("bob"));
    }

    #[tokio::test]
    async fn pending_users_cannot_mutate() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        bob.drain();

        bob.send(&router, "add_ticket", json!({"content": "sneaky"}))
            .await;

        assert_eq!(error_codes(&bob.drain()), vec!["not_approved"]);
        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert!(stored.tickets.is_empty());
    }

    #[tokio::test]
    async fn pending_users_do_not_see_room_traffic() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        alice.drain();
        bob.drain();

        alice
            .send(&router, "add_ticket", json!({"content": "slow CI"}))
            .await;

        assert!(kinds(&alice.drain()).contains(&"ticket_added"));
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn vote_quota_is_enforced_over_the_wire() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;

        for content in ["slow CI", "flaky tests", "bad docs", "no coffee"] {
            alice
                .send(&router, "add_ticket", json!({"content": content}))
                .await;
        }
        alice
            .send(&router, "set_phase", json!({"phase": "voting"}))
            .await;

        for content in ["slow CI", "flaky tests", "bad docs"] {
            let ticket_id = ticket_id_by_content(&router, room_id, content).await;
            alice
                .send(&router, "vote", json!({"ticket_id": ticket_id}))
                .await;
        }
        let frames = alice.drain();
        assert_eq!(
            kinds(&frames).iter().filter(|k| **k == "vote_updated").count(),
            3
        );

        let fourth = ticket_id_by_content(&router, room_id, "no coffee").await;
        alice
            .send(&router, "vote", json!({"ticket_id": fourth}))
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["quota_exceeded"]);

        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert_eq!(stored.participant("alice").unwrap().votes_used, 3);
    }

    #[tokio::test]
    async fn phase_gates_reject_out_of_phase_operations() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        alice
            .send(&router, "add_ticket", json!({"content": "slow CI"}))
            .await;
        alice.drain();
        let ticket_id = ticket_id_by_content(&router, room_id, "slow CI").await;

        // voting is not open during ticketing
        alice
            .send(&router, "vote", json!({"ticket_id": ticket_id}))
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["wrong_phase"]);

        alice
            .send(&router, "set_phase", json!({"phase": "voting"}))
            .await;
        alice.drain();

        // and ticketing is closed once voting starts
        alice
            .send(&router, "add_ticket", json!({"content": "too late"}))
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["wrong_phase"]);

        alice
            .send(
                &router,
                "add_action",
                json!({"content": "fix it", "ticket_id": ticket_id}),
            )
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["wrong_phase"]);

        alice
            .send(&router, "set_phase", json!({"phase": "afterparty"}))
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["invalid_argument"]);
    }

    #[tokio::test]
    async fn merge_forest_is_enforced_over_the_wire() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        for content in ["t1", "t2", "t3"] {
            alice
                .send(&router, "add_ticket", json!({"content": content}))
                .await;
        }
        alice
            .send(&router, "set_phase", json!({"phase": "merging"}))
            .await;
        alice.drain();

        let t1 = ticket_id_by_content(&router, room_id, "t1").await;
        let t2 = ticket_id_by_content(&router, room_id, "t2").await;
        let t3 = ticket_id_by_content(&router, room_id, "t3").await;

        alice
            .send(
                &router,
                "edit_ticket",
                json!({"ticket_id": t2, "parent_id": t1}),
            )
            .await;
        assert!(kinds(&alice.drain()).contains(&"ticket_updated"));

        // chaining under a child is rejected
        alice
            .send(
                &router,
                "edit_ticket",
                json!({"ticket_id": t3, "parent_id": t2}),
            )
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["invalid_argument"]);

        alice
            .send(
                &router,
                "edit_ticket",
                json!({"ticket_id": t3, "parent_id": t1}),
            )
            .await;
        assert!(kinds(&alice.drain()).contains(&"ticket_updated"));

        // merged tickets cannot take votes
        alice
            .send(&router, "set_phase", json!({"phase": "voting"}))
            .await;
        alice.drain();
        alice.send(&router, "vote", json!({"ticket_id": t2})).await;
        assert_eq!(error_codes(&alice.drain()), vec!["invalid_argument"]);
    }

    #[tokio::test]
    async fn ticket_deletion_respects_authorship() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        let mut eve = TestClient::connect(&router, room_id, "eve").await;
        alice
            .send(&router, "approve_participant", json!({"user_id": "bob"}))
            .await;
        alice
            .send(&router, "approve_participant", json!({"user_id": "eve"}))
            .await;

        bob.send(&router, "add_ticket", json!({"content": "t1"}))
            .await;
        bob.send(&router, "add_ticket", json!({"content": "t3"}))
            .await;
        let t1 = ticket_id_by_content(&router, room_id, "t1").await;
        let t3 = ticket_id_by_content(&router, room_id, "t3").await;
        alice.drain();
        bob.drain();
        eve.drain();

        // author may delete their own ticket
        bob.send(&router, "delete_ticket", json!({"ticket_id": t1}))
            .await;
        assert!(kinds(&bob.drain()).contains(&"ticket_deleted"));

        // a plain participant may not delete someone else's
        eve.send(&router, "delete_ticket", json!({"ticket_id": t3}))
            .await;
        assert_eq!(error_codes(&eve.drain()), vec!["not_authorized"]);

        // the owner may
        alice
            .send(&router, "delete_ticket", json!({"ticket_id": t3}))
            .await;
        assert!(kinds(&alice.drain()).contains(&"ticket_deleted"));
        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert!(stored.tickets.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_parent_reroots_children() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        for content in ["t1", "t2"] {
            alice
                .send(&router, "add_ticket", json!({"content": content}))
                .await;
        }
        let t1 = ticket_id_by_content(&router, room_id, "t1").await;
        let t2 = ticket_id_by_content(&router, room_id, "t2").await;
        alice
            .send(
                &router,
                "edit_ticket",
                json!({"ticket_id": t2, "parent_id": t1}),
            )
            .await;
        alice.drain();

        alice
            .send(&router, "delete_ticket", json!({"ticket_id": t1}))
            .await;
        let frames = alice.drain();
        assert!(kinds(&frames).contains(&"ticket_deleted"));
        // the detached child is re-announced as a root
        let updated = frames
            .iter()
            .find(|f| f["type"] == "ticket_updated")
            .expect("detached child should be announced");
        assert_eq!(updated["payload"]["ticket"]["id"], json!(t2));
        assert!(updated["payload"]["ticket"]["parent_id"].is_null()
            || updated["payload"]["ticket"].get("parent_id").is_none());
    }

    #[tokio::test]
    async fn role_matrix_is_enforced() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        alice
            .send(&router, "approve_participant", json!({"user_id": "bob"}))
            .await;
        alice.drain();
        bob.drain();

        // participants cannot change the phase
        bob.send(&router, "set_phase", json!({"phase": "voting"}))
            .await;
        assert_eq!(error_codes(&bob.drain()), vec!["not_authorized"]);

        // only the owner assigns roles
        bob.send(
            &router,
            "set_role",
            json!({"user_id": "alice", "role": "participant"}),
        )
        .await;
        assert_eq!(error_codes(&bob.drain()), vec!["not_authorized"]);

        alice
            .send(
                &router,
                "set_role",
                json!({"user_id": "bob", "role": "moderator"}),
            )
            .await;
        assert!(kinds(&alice.drain()).contains(&"role_changed"));

        // a moderator can now drive the phase
        bob.send(&router, "set_phase", json!({"phase": "voting"}))
            .await;
        assert!(kinds(&bob.drain()).contains(&"phase_changed"));

        // but nobody removes the owner
        bob.send(&router, "remove_user", json!({"user_id": "alice"}))
            .await;
        assert_eq!(error_codes(&bob.drain()), vec!["not_authorized"]);
    }

    struct FlakyRepo {
        inner: Arc<dyn RoomRepository>,
        fail_updates: AtomicBool,
    }

    impl RoomRepository for FlakyRepo {
        fn create(&self, room: &Room) -> huddle_core::Result<()> {
            self.inner.create(room)
        }
        fn get(&self, id: Uuid) -> huddle_core::Result<Option<Room>> {
            self.inner.get(id)
        }
        fn update(&self, room: &Room) -> huddle_core::Result<()> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(DomainError::NotFound("injected write failure".into()));
            }
            self.inner.update(room)
        }
        fn delete(&self, id: Uuid) -> huddle_core::Result<()> {
            self.inner.delete(id)
        }
        fn list(&self) -> huddle_core::Result<Vec<Room>> {
            self.inner.list()
        }
        fn list_by_owner(&self, owner_id: &str) -> huddle_core::Result<Vec<Room>> {
            self.inner.list_by_owner(owner_id)
        }
        fn list_by_participant(&self, user_id: &str) -> huddle_core::Result<Vec<Room>> {
            self.inner.list_by_participant(user_id)
        }
    }

    #[tokio::test]
    async fn persistence_failure_isolates_the_sender() {
        let flaky = Arc::new(FlakyRepo {
            inner: Arc::new(Database::open_in_memory().unwrap()),
            fail_updates: AtomicBool::new(false),
        });
        let repo: Arc<dyn RoomRepository> = flaky.clone();
        let router = Router::new(repo.clone(), Arc::new(RoomRegistry::new(repo)), Hub::start());
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        alice
            .send(&router, "approve_participant", json!({"user_id": "bob"}))
            .await;
        alice.drain();
        bob.drain();

        flaky.fail_updates.store(true, Ordering::SeqCst);
        bob.send(&router, "add_ticket", json!({"content": "doomed"}))
            .await;

        assert_eq!(error_codes(&bob.drain()), vec!["persistence_failed"]);
        // nothing was broadcast and nothing was stored
        assert!(alice.drain().is_empty());
        flaky.fail_updates.store(false, Ordering::SeqCst);
        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert!(stored.tickets.is_empty());
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_get_errors() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        alice.drain();

        router.handle_frame(&alice.client, "not json").await;
        assert_eq!(error_codes(&alice.drain()), vec!["invalid_message"]);

        alice.send(&router, "warp_core_breach", json!({})).await;
        assert_eq!(error_codes(&alice.drain()), vec!["invalid_message"]);

        alice.send(&router, "vote", json!({})).await;
        assert_eq!(error_codes(&alice.drain()), vec!["invalid_argument"]);
    }

    #[tokio::test]
    async fn auto_approve_admits_new_joiners() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let alice = TestClient::connect(&router, room_id, "alice").await;
        alice
            .send(&router, "set_auto_approve", json!({"auto_approve": true}))
            .await;

        let mut bob = TestClient::connect(&router, room_id, "bob").await;
        let bob_frames = bob.drain();
        let state = &bob_frames[0];
        assert_eq!(state["type"], "room_state");
        assert!(state["payload"]["participants"]
            .as_object()
            .unwrap()
            .contains_key("bob"));
    }

    #[tokio::test]
    async fn covering_and_unvoting_round_trip_over_the_wire() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        alice
            .send(&router, "add_ticket", json!({"content": "slow CI"}))
            .await;
        let ticket_id = ticket_id_by_content(&router, room_id, "slow CI").await;

        alice
            .send(&router, "set_phase", json!({"phase": "voting"}))
            .await;
        alice.send(&router, "vote", json!({"ticket_id": ticket_id})).await;
        alice
            .send(&router, "unvote", json!({"ticket_id": ticket_id}))
            .await;
        alice.drain();

        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert_eq!(stored.ticket(ticket_id).unwrap().votes, 0);
        assert_eq!(stored.participant("alice").unwrap().votes_used, 0);

        // covering is gated to discussion and summary
        alice
            .send(
                &router,
                "mark_covered",
                json!({"ticket_id": ticket_id, "covered": true}),
            )
            .await;
        assert_eq!(error_codes(&alice.drain()), vec!["wrong_phase"]);

        alice
            .send(&router, "set_phase", json!({"phase": "discussion"}))
            .await;
        alice
            .send(
                &router,
                "mark_covered",
                json!({"ticket_id": ticket_id, "covered": true}),
            )
            .await;
        alice.drain();
        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert!(stored.ticket(ticket_id).unwrap().covered);
    }

    struct StaticSuggester {
        groups: Vec<MergeGroup>,
        actions: Vec<ProposedAction>,
    }

    #[async_trait]
    impl Suggester for StaticSuggester {
        async fn suggest_merges(
            &self,
            _tickets: &[Ticket],
        ) -> Result<Vec<MergeGroup>, SuggestError> {
            Ok(self.groups.clone())
        }

        async fn propose_actions(
            &self,
            _tickets: &[Ticket],
            _context: &str,
        ) -> Result<Vec<ProposedAction>, SuggestError> {
            Ok(self.actions.clone())
        }
    }

    #[tokio::test]
    async fn auto_merge_requires_a_configured_suggester() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        alice
            .send(&router, "set_phase", json!({"phase": "merging"}))
            .await;
        alice.drain();

        alice.send(&router, "auto_merge", json!({})).await;
        assert_eq!(error_codes(&alice.drain()), vec!["suggester_unavailable"]);
    }

    #[tokio::test]
    async fn auto_merge_applies_valid_groups_only() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        for content in ["t1", "t2", "t3"] {
            alice
                .send(&router, "add_ticket", json!({"content": content}))
                .await;
        }
        let t1 = ticket_id_by_content(&router, room_id, "t1").await;
        let t2 = ticket_id_by_content(&router, room_id, "t2").await;
        let t3 = ticket_id_by_content(&router, room_id, "t3").await;

        let suggester = Arc::new(StaticSuggester {
            groups: vec![
                MergeGroup {
                    parent_ticket_id: t1,
                    // the self-merge and the unknown id must be skipped
                    child_ticket_ids: vec![t2, t1, Uuid::new_v4()],
                    reason: "same topic".into(),
                },
                MergeGroup {
                    parent_ticket_id: Uuid::new_v4(),
                    child_ticket_ids: vec![t3],
                    reason: "gone parent".into(),
                },
            ],
            actions: Vec::new(),
        });
        let router = Router {
            suggester: Some(suggester),
            ..router
        };

        alice
            .send(&router, "set_phase", json!({"phase": "merging"}))
            .await;
        alice.drain();
        alice.send(&router, "auto_merge", json!({})).await;

        let frames = alice.drain();
        assert!(kinds(&frames).contains(&"auto_merge_progress"));
        let complete = frames
            .iter()
            .find(|f| f["type"] == "auto_merge_complete")
            .unwrap();
        assert_eq!(complete["payload"]["merges_applied"], 1);
        assert_eq!(complete["payload"]["groups_count"], 2);

        let stored = router.repo.get(room_id).unwrap().unwrap();
        assert_eq!(stored.ticket(t2).unwrap().parent_id, Some(t1));
        assert!(stored.ticket(t3).unwrap().is_root());
    }

    #[tokio::test]
    async fn auto_proposed_actions_carry_the_marker_prefix() {
        let router = new_router();
        let room_id = create_room(&router, "alice", 3);
        let mut alice = TestClient::connect(&router, room_id, "alice").await;
        alice
            .send(&router, "add_ticket", json!({"content": "slow CI"}))
            .await;
        let ticket_id = ticket_id_by_content(&router, room_id, "slow CI").await;

        let suggester = Arc::new(StaticSuggester {
            groups: Vec::new(),
            actions: vec![
                ProposedAction {
                    content: "buy faster runners".into(),
                    ticket_id,
                    reason: "highest voted".into(),
                },
                ProposedAction {
                    content: "orphaned".into(),
                    ticket_id: Uuid::new_v4(),
                    reason: String::new(),
                },
            ],
        });
        let router = Router {
            suggester: Some(suggester),
            ..router
        };

        alice
            .send(&router, "set_phase", json!({"phase": "discussion"}))
            .await;
        alice.drain();
        alice.send(&router, "auto_propose_actions", json!({})).await;

        let frames = alice.drain();
        let complete = frames
            .iter()
            .find(|f| f["type"] == "auto_propose_complete")
            .unwrap();
        assert_eq!(complete["payload"]["actions_created"], 1);

        let stored = router.repo.get(room_id).unwrap().unwrap();
        let action = stored.action_items.values().next().unwrap();
        assert!(action.content.starts_with('\u{1f916}'));
        assert!(action.content.ends_with("buy faster runners"));
    }
}
