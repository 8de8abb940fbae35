//! Typed domain errors

use crate::domain::types::ReservationId;
use thiserror::Error;

/// Failure reported by a reservation backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duplicate reservation id: {0}")]
    Duplicate(ReservationId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("invalid reservation: {0}")]
    Validation(String),
    #[error("reservation conflicts with {existing}")]
    Conflict { existing: ReservationId },
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ReservationError {
    fn from(err: StorageError) -> Self {
        match err {
            // uniqueness violations surface the same way as the overlap pre-check
            StorageError::Duplicate(id) => ReservationError::Conflict { existing: id },
            StorageError::Backend(msg) => ReservationError::Storage(msg),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ClockError {
    #[error("time scale must be in (0, 10000], got {0}")]
    InvalidScale(f64),
    #[error("utc offset out of range: {0} minutes")]
    InvalidOffset(i32),
    #[error("unparseable timestamp: {0}")]
    Parse(String),
}
