use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, ConflictInfo};

/// Coarse category of an [`EngineError`], for mapping onto response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InvalidTransition,
    Permission,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("location not found: {0}")]
    LocationNotFound(Ulid),

    #[error("space {space_id} not found in location {location_id}")]
    SpaceNotFound { location_id: Ulid, space_id: String },

    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("time range conflicts with {} existing booking(s)", .conflicts.len())]
    Conflict { conflicts: Vec<ConflictInfo> },

    #[error("cannot {action} a {from} booking (allowed transitions: {allowed:?})")]
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
        allowed: Vec<BookingStatus>,
        hint: Option<&'static str>,
    },

    #[error("{actor} is not permitted to {action}")]
    Permission { actor: String, action: &'static str },

    #[error("space {space_id} is in use by booking {booking_id}")]
    ActiveBookingConflict { space_id: String, booking_id: Ulid },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::LocationNotFound(_)
            | EngineError::SpaceNotFound { .. }
            | EngineError::BookingNotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::Conflict { .. }
            | EngineError::ActiveBookingConflict { .. } => ErrorKind::Conflict,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::Permission { .. } => ErrorKind::Permission,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Persistence hiccups are the only errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}
