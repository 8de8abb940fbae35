//! Per-room reconciliation state machine
//!
//! Follows one reservation at a time and reconciles it against the filtered
//! occupancy signal. Guards are evaluated in order on every tick, each gated
//! on the state it leaves from.

use crate::domain::error::ReservationError;
use crate::domain::types::{
    PenaltyReason, Reservation, ReservationId, ReservationStatus, RoomId, Timestamp, UserId,
};
use crate::services::penalty::{InMemoryPenaltyRepository, PenaltyLedger, PenaltyRepository};
use crate::services::reservation_store::{InMemoryBackend, ReservationBackend, ReservationStore};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Idle,
    ReservedNotUsed,
    InUse,
    Finished,
}

impl RoomState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomState::Idle => "IDLE",
            RoomState::ReservedNotUsed => "RESERVED_NOT_USED",
            RoomState::InUse => "IN_USE",
            RoomState::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomTiming {
    pub arrival_before: chrono::Duration,
    pub arrival_after: chrono::Duration,
    pub grace: chrono::Duration,
    pub cleanup: chrono::Duration,
}

impl Default for RoomTiming {
    fn default() -> Self {
        Self {
            arrival_before: chrono::Duration::minutes(10),
            arrival_after: chrono::Duration::minutes(15),
            grace: chrono::Duration::minutes(10),
            cleanup: chrono::Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomAlert {
    /// Still occupied past end plus grace
    Overstay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    CheckIn { reservation_id: ReservationId, user_id: UserId },
    NoShow { reservation_id: ReservationId, user_id: UserId, penalty_count: usize },
    SessionFinished { reservation_id: ReservationId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutcome {
    pub state: RoomState,
    pub reservation_id: Option<ReservationId>,
    pub is_occupied: bool,
    pub alert: Option<RoomAlert>,
    #[serde(skip)]
    pub events: SmallVec<[RoomEvent; 2]>,
}

pub struct RoomStateMachine {
    room_id: RoomId,
    timing: RoomTiming,
    state: RoomState,
    target: Option<ReservationId>,
}

impl RoomStateMachine {
    pub fn new(room_id: RoomId, timing: RoomTiming) -> Self {
        Self { room_id, timing, state: RoomState::Idle, target: None }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn target(&self) -> Option<&ReservationId> {
        self.target.as_ref()
    }

    /// Advance the machine by one tick
    pub fn update<B, R>(
        &mut self,
        store: &ReservationStore<B>,
        ledger: &PenaltyLedger<R>,
        is_occupied: bool,
        now: Timestamp,
    ) -> Result<TickOutcome, ReservationError>
    where
        B: ReservationBackend,
        R: PenaltyRepository,
    {
        let mut events = SmallVec::new();
        let mut alert = None;

        let mut current = match &self.target {
            Some(id) => store.get_by_id(id)?,
            None => None,
        };

        let stale = match &current {
            None => true,
            Some(r) => {
                r.status == ReservationStatus::Cancelled || now > r.end + self.timing.cleanup
            }
        };
        if stale {
            current = self.select_target(store, now)?;
            let next = current.as_ref().map(|r| r.id.clone());
            if next != self.target {
                debug!(
                    room_id = %self.room_id,
                    previous = ?self.target,
                    next = ?next,
                    "target_reselected"
                );
            }
            self.target = next;
            self.state = RoomState::Idle;
        }

        let Some(res) = current else {
            return Ok(self.outcome(is_occupied, None, events));
        };

        if self.state == RoomState::Idle && now >= res.start - self.timing.arrival_before {
            self.transition(RoomState::ReservedNotUsed, &res.id);
        }

        if self.state == RoomState::ReservedNotUsed {
            if is_occupied {
                self.transition(RoomState::InUse, &res.id);
                let changed = store.mark_used(&res.id)?;
                info!(
                    room_id = %self.room_id,
                    reservation_id = %res.id,
                    user_id = %res.user_id,
                    status_changed = %changed,
                    "check_in_detected"
                );
                events.push(RoomEvent::CheckIn {
                    reservation_id: res.id.clone(),
                    user_id: res.user_id.clone(),
                });
            } else if now > res.start + self.timing.arrival_after {
                self.transition(RoomState::Finished, &res.id);
                if res.status == ReservationStatus::Active && store.mark_no_show(&res.id)? {
                    let penalty_count =
                        ledger.add_penalty(&res.user_id, PenaltyReason::NoShow, now);
                    warn!(
                        room_id = %self.room_id,
                        reservation_id = %res.id,
                        user_id = %res.user_id,
                        penalty_count = %penalty_count,
                        "no_show_detected"
                    );
                    events.push(RoomEvent::NoShow {
                        reservation_id: res.id.clone(),
                        user_id: res.user_id.clone(),
                        penalty_count,
                    });
                }
            }
        }

        if self.state == RoomState::InUse && now > res.end + self.timing.grace {
            if is_occupied {
                alert = Some(RoomAlert::Overstay);
                debug!(room_id = %self.room_id, reservation_id = %res.id, "overstay_alert");
            } else {
                self.transition(RoomState::Finished, &res.id);
                events.push(RoomEvent::SessionFinished { reservation_id: res.id.clone() });
            }
        }

        let mut outcome = self.outcome(is_occupied, alert, events);
        outcome.reservation_id = Some(res.id);
        Ok(outcome)
    }

    /// Earliest-starting reservation that is not cancelled and still within
    /// its cleanup margin
    fn select_target<B: ReservationBackend>(
        &self,
        store: &ReservationStore<B>,
        now: Timestamp,
    ) -> Result<Option<Reservation>, ReservationError> {
        let reservations = store.list_for_room(&self.room_id)?;
        Ok(reservations
            .into_iter()
            .filter(|r| r.status != ReservationStatus::Cancelled)
            .filter(|r| r.end + self.timing.cleanup >= now)
            .min_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id))))
    }

    fn transition(&mut self, next: RoomState, reservation: &ReservationId) {
        info!(
            room_id = %self.room_id,
            reservation_id = %reservation,
            from = %self.state,
            to = %next,
            "room_state_changed"
        );
        self.state = next;
    }

    fn outcome(
        &self,
        is_occupied: bool,
        alert: Option<RoomAlert>,
        events: SmallVec<[RoomEvent; 2]>,
    ) -> TickOutcome {
        TickOutcome {
            state: self.state,
            reservation_id: self.target.clone(),
            is_occupied,
            alert,
            events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub state: RoomState,
    pub reservation_id: Option<ReservationId>,
}

/// Room id to state machine, created on first reference
///
/// Each machine sits behind its own lock, so ticks for one room are
/// sequential while different rooms tick independently.
pub struct RoomRegistry<
    B: ReservationBackend = InMemoryBackend,
    R: PenaltyRepository = InMemoryPenaltyRepository,
> {
    store: Arc<ReservationStore<B>>,
    ledger: Arc<PenaltyLedger<R>>,
    timing: RoomTiming,
    rooms: RwLock<FxHashMap<RoomId, Arc<Mutex<RoomStateMachine>>>>,
}

impl<B: ReservationBackend, R: PenaltyRepository> RoomRegistry<B, R> {
    pub fn new(
        store: Arc<ReservationStore<B>>,
        ledger: Arc<PenaltyLedger<R>>,
        timing: RoomTiming,
    ) -> Self {
        Self { store, ledger, timing, rooms: RwLock::new(FxHashMap::default()) }
    }

    pub fn store(&self) -> &Arc<ReservationStore<B>> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<PenaltyLedger<R>> {
        &self.ledger
    }

    pub fn timing(&self) -> RoomTiming {
        self.timing
    }

    pub fn machine(&self, room: &RoomId) -> Arc<Mutex<RoomStateMachine>> {
        if let Some(machine) = self.rooms.read().get(room) {
            return machine.clone();
        }
        self.rooms
            .write()
            .entry(room.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RoomStateMachine::new(room.clone(), self.timing)))
            })
            .clone()
    }

    pub fn tick(
        &self,
        room: &RoomId,
        is_occupied: bool,
        now: Timestamp,
    ) -> Result<TickOutcome, ReservationError> {
        let machine = self.machine(room);
        let mut machine = machine.lock();
        machine.update(&self.store, &self.ledger, is_occupied, now)
    }

    /// Current state of every known room, sorted by room id
    pub fn states(&self) -> Vec<RoomStatus> {
        let mut all: Vec<RoomStatus> = self
            .rooms
            .read()
            .values()
            .map(|m| {
                let m = m.lock();
                RoomStatus {
                    room_id: m.room_id().clone(),
                    state: m.state(),
                    reservation_id: m.target().cloned(),
                }
            })
            .collect();
        all.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::penalty::PenaltyPolicy;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn at(hour: u32, min: u32) -> Timestamp {
        offset().with_ymd_and_hms(2026, 4, 1, hour, min, 0).unwrap()
    }

    fn room() -> RoomId {
        RoomId::from("room-a")
    }

    fn setup() -> (Arc<ReservationStore>, Arc<PenaltyLedger>, RoomStateMachine) {
        let store = Arc::new(ReservationStore::in_memory(Duration::minutes(5), offset()));
        let ledger = Arc::new(PenaltyLedger::in_memory(PenaltyPolicy::default()));
        (store, ledger, RoomStateMachine::new(room(), RoomTiming::default()))
    }

    #[test]
    fn test_no_target_is_idle() {
        let (store, ledger, mut fsm) = setup();
        let out = fsm.update(&store, &ledger, true, at(10, 0)).unwrap();
        assert_eq!(out.state, RoomState::Idle);
        assert_eq!(out.reservation_id, None);
        assert_eq!(out.alert, None);
    }

    #[test]
    fn test_arrival_window_opens_reserved_not_used() {
        let (store, ledger, mut fsm) = setup();
        let r = store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();

        let out = fsm.update(&store, &ledger, false, at(9, 49)).unwrap();
        assert_eq!(out.state, RoomState::Idle);
        assert_eq!(out.reservation_id, Some(r.id.clone()));

        let out = fsm.update(&store, &ledger, false, at(9, 50)).unwrap();
        assert_eq!(out.state, RoomState::ReservedNotUsed);
    }

    #[test]
    fn test_checkin_marks_used_without_penalty() {
        let (store, ledger, mut fsm) = setup();
        let r = store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();

        fsm.update(&store, &ledger, false, at(9, 55)).unwrap();
        let out = fsm.update(&store, &ledger, true, at(10, 5)).unwrap();

        assert_eq!(out.state, RoomState::InUse);
        assert!(matches!(out.events[0], RoomEvent::CheckIn { .. }));
        assert_eq!(store.require(&r.id).unwrap().status, ReservationStatus::Used);

        let out = fsm.update(&store, &ledger, false, at(10, 40)).unwrap();
        assert_eq!(out.state, RoomState::InUse);
        assert_eq!(ledger.penalty_count(&"alice".into()), 0);
    }

    #[test]
    fn test_guards_cascade_within_one_tick() {
        let (store, ledger, mut fsm) = setup();
        store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();

        let out = fsm.update(&store, &ledger, true, at(10, 2)).unwrap();
        assert_eq!(out.state, RoomState::InUse);
    }

    #[test]
    fn test_no_show_penalized_exactly_once() {
        let (store, ledger, mut fsm) = setup();
        let alice = UserId::from("alice");
        let r = store.create(&room(), &alice, at(10, 0), at(11, 0), None).unwrap();

        let out = fsm.update(&store, &ledger, false, at(10, 15)).unwrap();
        assert_eq!(out.state, RoomState::ReservedNotUsed);

        let out = fsm.update(&store, &ledger, false, at(10, 22)).unwrap();
        assert_eq!(out.state, RoomState::Finished);
        assert_eq!(store.require(&r.id).unwrap().status, ReservationStatus::NoShow);
        assert_eq!(out.events.len(), 1);
        assert_eq!(ledger.penalty_count(&alice), 1);

        for min in 23..40 {
            let out = fsm.update(&store, &ledger, false, at(10, min)).unwrap();
            assert_eq!(out.state, RoomState::Finished);
            assert!(out.events.is_empty());
        }
        assert_eq!(ledger.penalty_count(&alice), 1);
    }

    #[test]
    fn test_overstay_alert_every_tick_while_occupied() {
        let (store, ledger, mut fsm) = setup();
        store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        fsm.update(&store, &ledger, true, at(10, 0)).unwrap();

        let out = fsm.update(&store, &ledger, true, at(11, 10)).unwrap();
        assert_eq!(out.alert, None);

        for min in 11..15 {
            let out = fsm.update(&store, &ledger, true, at(11, min)).unwrap();
            assert_eq!(out.state, RoomState::InUse);
            assert_eq!(out.alert, Some(RoomAlert::Overstay));
        }

        let out = fsm.update(&store, &ledger, false, at(11, 15)).unwrap();
        assert_eq!(out.state, RoomState::Finished);
        assert_eq!(out.alert, None);
        assert!(matches!(out.events[0], RoomEvent::SessionFinished { .. }));
    }

    #[test]
    fn test_finished_is_sticky_until_cleanup_then_next_target() {
        let (store, ledger, mut fsm) = setup();
        let first = store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        let second = store.create(&room(), &"bob".into(), at(12, 0), at(13, 0), None).unwrap();

        fsm.update(&store, &ledger, true, at(10, 0)).unwrap();
        let out = fsm.update(&store, &ledger, false, at(11, 11)).unwrap();
        assert_eq!(out.state, RoomState::Finished);

        let out = fsm.update(&store, &ledger, false, at(11, 30)).unwrap();
        assert_eq!(out.state, RoomState::Finished);
        assert_eq!(out.reservation_id, Some(first.id));

        let out = fsm.update(&store, &ledger, false, at(11, 31)).unwrap();
        assert_eq!(out.state, RoomState::Idle);
        assert_eq!(out.reservation_id, Some(second.id));
    }

    #[test]
    fn test_cancelled_target_forces_reselection() {
        let (store, ledger, mut fsm) = setup();
        let r = store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        let out = fsm.update(&store, &ledger, false, at(9, 55)).unwrap();
        assert_eq!(out.state, RoomState::ReservedNotUsed);

        store.cancel(&r.id).unwrap();
        let out = fsm.update(&store, &ledger, false, at(9, 56)).unwrap();
        assert_eq!(out.state, RoomState::Idle);
        assert_eq!(out.reservation_id, None);
    }

    #[test]
    fn test_registry_creates_machines_per_room() {
        let (store, ledger, _) = setup();
        store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        let registry = RoomRegistry::new(store, ledger, RoomTiming::default());

        registry.tick(&room(), false, at(9, 55)).unwrap();
        registry.tick(&"room-b".into(), false, at(9, 55)).unwrap();
        assert!(Arc::ptr_eq(&registry.machine(&room()), &registry.machine(&room())));

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].state, RoomState::ReservedNotUsed);
        assert_eq!(states[1].state, RoomState::Idle);
    }
}
