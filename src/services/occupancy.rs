//! Per-room live occupancy counters
//!
//! `OccupancyCounter` is the lock-guarded aggregate fed by crossing events.
//! `OccupancyBoard` maps room ids to counters, creating them on first use.

use crate::domain::types::{CrossingEvent, CrossingKind, RoomId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OccupancySnapshot {
    pub occupancy: u32,
    pub enter: u64,
    pub exit: u64,
    pub filtered: u64,
    pub checkin_success: u64,
    pub checkin_fail: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingOutcome {
    /// Below the confidence floor, occupancy untouched
    Filtered,
    Applied { delta: i64, occupancy: u32 },
}

#[derive(Debug, Default)]
pub struct OccupancyCounter {
    inner: Mutex<OccupancySnapshot>,
}

impl OccupancyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one crossing; occupancy never drops below zero
    pub fn apply(&self, event: &CrossingEvent, confidence_min: f64) -> CrossingOutcome {
        let mut state = self.inner.lock();
        if event.confidence < confidence_min {
            state.filtered += 1;
            return CrossingOutcome::Filtered;
        }

        let delta = event.kind.delta();
        match event.kind {
            CrossingKind::Enter => {
                state.occupancy = state.occupancy.saturating_add(1);
                state.enter += 1;
            }
            CrossingKind::Exit => {
                state.occupancy = state.occupancy.saturating_sub(1);
                state.exit += 1;
            }
        }
        CrossingOutcome::Applied { delta, occupancy: state.occupancy }
    }

    pub fn record_checkin(&self, success: bool) {
        let mut state = self.inner.lock();
        if success {
            state.checkin_success += 1;
        } else {
            state.checkin_fail += 1;
        }
    }

    /// Manual override, e.g. from an operator correction
    pub fn set_occupancy(&self, occupancy: u32) {
        self.inner.lock().occupancy = occupancy;
    }

    pub fn occupancy(&self) -> u32 {
        self.inner.lock().occupancy
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        *self.inner.lock()
    }
}

#[derive(Default)]
pub struct OccupancyBoard {
    rooms: RwLock<FxHashMap<RoomId, Arc<OccupancyCounter>>>,
}

impl OccupancyBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, room: &RoomId) -> Arc<OccupancyCounter> {
        if let Some(counter) = self.rooms.read().get(room) {
            return counter.clone();
        }
        self.rooms.write().entry(room.clone()).or_default().clone()
    }

    /// Zero for rooms never seen
    pub fn occupancy(&self, room: &RoomId) -> u32 {
        self.rooms.read().get(room).map_or(0, |c| c.occupancy())
    }

    /// Snapshot of every known room, sorted by room id
    pub fn snapshot_all(&self) -> Vec<(RoomId, OccupancySnapshot)> {
        let mut all: Vec<_> =
            self.rooms.read().iter().map(|(room, c)| (room.clone(), c.snapshot())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enter(confidence: f64) -> CrossingEvent {
        CrossingEvent { kind: CrossingKind::Enter, confidence }
    }

    fn exit(confidence: f64) -> CrossingEvent {
        CrossingEvent { kind: CrossingKind::Exit, confidence }
    }

    #[test]
    fn test_apply_enter_exit() {
        let counter = OccupancyCounter::new();
        assert_eq!(counter.apply(&enter(0.95), 0.9), CrossingOutcome::Applied { delta: 1, occupancy: 1 });
        assert_eq!(counter.apply(&enter(0.95), 0.9), CrossingOutcome::Applied { delta: 1, occupancy: 2 });
        assert_eq!(counter.apply(&exit(0.95), 0.9), CrossingOutcome::Applied { delta: -1, occupancy: 1 });

        let snap = counter.snapshot();
        assert_eq!(snap.enter, 2);
        assert_eq!(snap.exit, 1);
    }

    #[test]
    fn test_occupancy_clips_at_zero() {
        let counter = OccupancyCounter::new();
        counter.apply(&exit(1.0), 0.9);
        counter.apply(&exit(1.0), 0.9);
        assert_eq!(counter.occupancy(), 0);
        assert_eq!(counter.snapshot().exit, 2);
    }

    #[test]
    fn test_low_confidence_is_filtered() {
        let counter = OccupancyCounter::new();
        assert_eq!(counter.apply(&enter(0.89), 0.9), CrossingOutcome::Filtered);
        assert_eq!(counter.occupancy(), 0);
        assert_eq!(counter.snapshot().filtered, 1);
        assert_eq!(counter.snapshot().enter, 0);
    }

    #[test]
    fn test_checkin_counters() {
        let counter = OccupancyCounter::new();
        counter.record_checkin(true);
        counter.record_checkin(false);
        counter.record_checkin(false);
        let snap = counter.snapshot();
        assert_eq!((snap.checkin_success, snap.checkin_fail), (1, 2));
    }

    #[test]
    fn test_board_creates_on_first_reference() {
        let board = OccupancyBoard::new();
        let room = RoomId::from("room-a");
        assert_eq!(board.occupancy(&room), 0);
        assert!(board.snapshot_all().is_empty());

        board.counter(&room).apply(&enter(1.0), 0.9);
        assert_eq!(board.occupancy(&room), 1);
        assert!(Arc::ptr_eq(&board.counter(&room), &board.counter(&room)));
        assert_eq!(board.snapshot_all().len(), 1);
    }
}
