//! Huddle Core Library
//!
//! Domain models, invariants, and storage for the huddle retrospective
//! server.

pub mod error;
pub mod invariants;
pub mod models;
pub mod storage;

pub use error::{Error, Result};
pub use models::*;
pub use storage::{Database, RoomRepository};
