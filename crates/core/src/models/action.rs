//! Action item model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A follow-up task recorded against a ticket during discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: Uuid,
    pub content: String,
    pub ticket_id: Uuid,
    pub assignee_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ActionItem {
    pub fn new(content: String, ticket_id: Uuid, assignee_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            ticket_id,
            assignee_ids,
            created_at: Utc::now(),
        }
    }
}
