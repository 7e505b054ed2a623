//! Ticket model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A retrospective item raised during the ticketing phase.
///
/// Merged tickets carry a `parent_id` pointing at a root ticket; merges
/// form a forest of depth one, enforced by the room operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub content: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub votes: u32,
    pub voter_ids: Vec<String>,
    pub covered: bool,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(content: String, author_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            author_id,
            parent_id: None,
            votes: 0,
            voter_ids: Vec::new(),
            covered: false,
            created_at: Utc::now(),
        }
    }

    /// A root ticket has no parent and is a valid merge target.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
