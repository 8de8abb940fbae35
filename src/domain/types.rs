//! Shared types for room reservation tracking

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// All timestamps are carried in the site's configured zone
pub type Timestamp = DateTime<FixedOffset>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Newtype wrapper for room identifiers
    RoomId
);
string_id!(
    /// Newtype wrapper for user identifiers
    UserId
);
string_id!(
    /// Newtype wrapper for reservation identifiers
    ReservationId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Used,
    NoShow,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Used => "USED",
            ReservationStatus::NoShow => "NO_SHOW",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    /// USED, NO_SHOW and CANCELLED never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub status: ReservationStatus,
}

impl Reservation {
    /// True if `[start, end]` would sit closer than `buffer` to this reservation
    ///
    /// Neighbours need one `buffer` of gap between them, not one on each side.
    pub fn collides_with(&self, start: Timestamp, end: Timestamp, buffer: chrono::Duration) -> bool {
        end > self.start - buffer && start < self.end + buffer
    }

    /// Closed interval check, matching how active reservations are looked up
    pub fn contains(&self, now: Timestamp) -> bool {
        self.start <= now && now <= self.end
    }
}

/// Canonical detection box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub score: f64,
}

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64, score: f64) -> Self {
        Self { left, top, right, bottom, score }
    }

    pub fn width(&self) -> f64 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let iy = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingKind {
    Enter,
    Exit,
}

impl CrossingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingKind::Enter => "enter",
            CrossingKind::Exit => "exit",
        }
    }

    /// Occupancy change implied by the crossing
    pub fn delta(&self) -> i64 {
        match self {
            CrossingKind::Enter => 1,
            CrossingKind::Exit => -1,
        }
    }
}

/// One line crossing produced by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    #[serde(rename = "type")]
    pub kind: CrossingKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PenaltyReason {
    NoShow,
    #[serde(untagged)]
    Other(String),
}

impl PenaltyReason {
    pub fn as_str(&self) -> &str {
        match self {
            PenaltyReason::NoShow => "NO_SHOW",
            PenaltyReason::Other(reason) => reason,
        }
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only penalty log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyEvent {
    pub user_id: UserId,
    pub reason: PenaltyReason,
    pub points: u32,
    pub at: Timestamp,
}
