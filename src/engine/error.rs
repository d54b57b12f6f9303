use ulid::Ulid;

use super::conflict::ReservationConflict;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The unit is not reservable right now. Expected, not a failure.
    Conflict(ReservationConflict),
    /// Malformed request or inventory, rejected before any transaction.
    Invalid(String),
    LimitExceeded(&'static str),
    HasActiveReservations(Ulid),
    /// Lock wait exceeded the caller's timeout. Nothing was written.
    Timeout,
    /// Storage failed twice in a row. Safe to retry the same request.
    Transient(String),
    WalError(String),
}

impl EngineError {
    /// Whether the caller may resubmit the identical request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::Timeout)
    }

    pub fn conflict(&self) -> Option<&ReservationConflict> {
        match self {
            EngineError::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(c) => write!(f, "conflict: {} ({c})", c.reason),
            EngineError::Invalid(msg) => write!(f, "invalid: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::HasActiveReservations(id) => {
                write!(f, "apartment {id} still has active reservations")
            }
            EngineError::Timeout => write!(f, "timed out waiting for apartment lock"),
            EngineError::Transient(e) => write!(f, "transient storage failure, retry: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
