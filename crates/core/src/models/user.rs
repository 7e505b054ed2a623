//! User identity model

use serde::{Deserialize, Serialize};

/// A user as reported by the authenticating reverse proxy.
///
/// The core never creates users on its own; every request carries the
/// caller's identity in headers and participants keep a by-value copy.
/// Display names may drift between rooms; that is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}
