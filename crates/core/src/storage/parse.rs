//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use chrono::{DateTime, Utc};
use rusqlite::Error as SqlError;
use uuid::Uuid;

use crate::models::{Phase, Role, Status};

fn conversion_failure<E>(err: E) -> SqlError
where
    E: std::error::Error + Send + Sync + 'static,
{
    SqlError::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s).map_err(conversion_failure)
}

/// Parse an optional UUID from a database string column
pub fn parse_uuid_opt(s: Option<String>) -> Result<Option<Uuid>, SqlError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

/// Parse a DateTime from an RFC3339 string
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SqlError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_failure)
}

/// Parse a JSON array of user ids
pub fn parse_id_list(s: &str) -> Result<Vec<String>, SqlError> {
    serde_json::from_str(s).map_err(conversion_failure)
}

/// Parse a stored phase value
pub fn parse_phase(s: &str) -> Result<Phase, SqlError> {
    s.parse().map_err(conversion_failure)
}

/// Parse a stored role value
pub fn parse_role(s: &str) -> Result<Role, SqlError> {
    s.parse().map_err(conversion_failure)
}

/// Parse a stored status value
pub fn parse_status(s: &str) -> Result<Status, SqlError> {
    s.parse().map_err(conversion_failure)
}
