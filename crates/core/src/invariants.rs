//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use crate::models::Room;

/// Validate that a Room's state is internally consistent.
pub fn assert_room_invariants(room: &Room) {
    for ticket in room.tickets.values() {
        debug_assert_eq!(
            ticket.votes as usize,
            ticket.voter_ids.len(),
            "ticket {} vote count {} does not match its voter list ({})",
            ticket.id,
            ticket.votes,
            ticket.voter_ids.len()
        );

        // merges form a forest of depth one
        if let Some(parent_id) = ticket.parent_id {
            let parent = room.tickets.get(&parent_id);
            debug_assert!(
                parent.is_some(),
                "ticket {} references missing parent {}",
                ticket.id,
                parent_id
            );
            debug_assert!(
                parent.is_none_or(|p| p.parent_id.is_none()),
                "ticket {} is merged under non-root {}",
                ticket.id,
                parent_id
            );
        }

        for voter in &ticket.voter_ids {
            debug_assert!(
                room.participants.contains_key(voter),
                "ticket {} carries a vote from non-member {}",
                ticket.id,
                voter
            );
        }
    }

    for (user_id, participant) in &room.participants {
        debug_assert!(
            participant.votes_used <= room.votes_per_user,
            "participant {} used {} votes with a quota of {}",
            user_id,
            participant.votes_used,
            room.votes_per_user
        );

        let cast = room
            .tickets
            .values()
            .filter(|t| t.voter_ids.iter().any(|v| v == user_id))
            .count();
        debug_assert_eq!(
            cast, participant.votes_used as usize,
            "participant {} counter {} does not match {} cast votes",
            user_id, participant.votes_used, cast
        );

        debug_assert!(
            !room.pending_participants.contains_key(user_id),
            "user {} is both approved and pending",
            user_id
        );
    }

    for action in room.action_items.values() {
        debug_assert!(
            room.tickets.contains_key(&action.ticket_id),
            "action {} references missing ticket {}",
            action.id,
            action.ticket_id
        );
    }
}
