//! Domain models - core reservation and sensor types
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - Reservation, BoundingBox, CrossingEvent and id newtypes
//! - `clock` - Site clock with optional scaled simulation
//! - `error` - Typed reservation, storage and clock errors

pub mod clock;
pub mod error;
pub mod types;

// Re-export commonly used types at module level
pub use clock::{Clock, ClockStatus};
pub use error::{ClockError, ReservationError, StorageError};
pub use types::{
    BoundingBox, CrossingEvent, CrossingKind, PenaltyEvent, PenaltyReason, Reservation,
    ReservationId, ReservationStatus, RoomId, Timestamp, UserId,
};
