//! Participant and role models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use super::User;

/// Room roles. The owner is fixed at creation; moderators are promoted
/// participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Moderator,
    Participant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Moderator => "moderator",
            Role::Participant => "participant",
        }
    }

    /// Can this role perform moderator actions?
    pub fn is_moderator(self) -> bool {
        matches!(self, Role::Owner | Role::Moderator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "owner" => Ok(Role::Owner),
            "moderator" => Ok(Role::Moderator),
            "participant" => Ok(Role::Participant),
            other => Err(Error::InvalidArgument(format!("unknown role: {other}"))),
        }
    }
}

/// Membership status within a room. Pending users see nothing but the
/// room's name and phase until a moderator approves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Approved,
    Pending,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Approved => "approved",
            Status::Pending => "pending",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "approved" => Ok(Status::Approved),
            "pending" => Ok(Status::Pending),
            other => Err(Error::InvalidArgument(format!("unknown status: {other}"))),
        }
    }
}

/// A user's membership in one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user: User,
    pub role: Role,
    pub status: Status,
    pub votes_used: u32,
}

impl Participant {
    pub fn new(user: User, role: Role, status: Status) -> Self {
        Self {
            user,
            role,
            status,
            votes_used: 0,
        }
    }
}
