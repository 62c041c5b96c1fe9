use ulid::Ulid;

use crate::model::Ms;
use crate::tz::TzError;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input that should have been stopped at the boundary.
    Validation(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Profile name already taken.
    Conflict(String),
    InvalidRange {
        start: Ms,
        end: Ms,
    },
    /// Referenced profile ids that do not resolve.
    ProfileNotFound(Vec<Ulid>),
    InvalidZone(String),
    InvalidDateTime(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(name) => write!(f, "profile name already exists: {name}"),
            EngineError::InvalidRange { start, end } => {
                write!(f, "end {end} is before start {start}")
            }
            EngineError::ProfileNotFound(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "profiles not found: {}", ids.join(", "))
            }
            EngineError::InvalidZone(z) => write!(f, "unknown timezone: {z}"),
            EngineError::InvalidDateTime(s) => write!(f, "invalid date/time: {s}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<TzError> for EngineError {
    fn from(e: TzError) -> Self {
        match e {
            TzError::InvalidZone(z) => EngineError::InvalidZone(z),
            TzError::InvalidDateTime(s) => EngineError::InvalidDateTime(s),
        }
    }
}
