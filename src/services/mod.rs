//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `reservation_store` - Reservation lifecycle and collision checks
//! - `penalty` - No-show penalty points and bans
//! - `occupancy_filter` - Majority vote with hysteresis over raw counts
//! - `line_tracker` - Detection tracking and virtual line crossings
//! - `occupancy` - Per-room live occupancy counters
//! - `room_state` - Per-room reservation state machine
//! - `watchers` - Periodic no-show and end-of-session scans
//! - `poller` - Sensor polling loop feeding occupancy
//! - `ticker` - Occupancy source to room state machine loop

pub mod line_tracker;
pub mod occupancy;
pub mod occupancy_filter;
pub mod penalty;
pub mod poller;
pub mod reservation_store;
pub mod room_state;
pub mod ticker;
pub mod watchers;

// Re-export commonly used types
pub use line_tracker::{LineSettings, LineTracker};
pub use occupancy::{OccupancyBoard, OccupancyCounter};
pub use occupancy_filter::{FilterSettings, OccupancyFilter};
pub use penalty::{PenaltyLedger, PenaltyPolicy};
pub use poller::{ArrivalWindows, CrossingProcessor, SensorPoller};
pub use reservation_store::ReservationStore;
pub use room_state::{RoomRegistry, RoomState, RoomStateMachine, RoomTiming};
pub use ticker::RoomTicker;
pub use watchers::{WatchBoard, WatcherSettings, Watchers};
