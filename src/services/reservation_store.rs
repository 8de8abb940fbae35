//! Reservation store with buffer-aware conflict checking
//!
//! Owns reservation records for every room. The single invariant enforced
//! here: for a fixed room, no two non-CANCELLED reservations sit closer
//! together than the configured buffer. Check and insert happen under one
//! store-level lock so a rejected create never leaves a partial write.
//!
//! Status transitions are one-way: ACTIVE may become USED, NO_SHOW or
//! CANCELLED, and nothing leaves those three.

use crate::domain::error::{ReservationError, StorageError};
use crate::domain::types::{
    Reservation, ReservationId, ReservationStatus, RoomId, Timestamp, UserId,
};
use chrono::{DateTime, FixedOffset, TimeZone};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

/// Row access for reservations
///
/// Implementations must reject inserting an id that already exists with
/// `StorageError::Duplicate`.
pub trait ReservationBackend: Send + Sync {
    fn insert(&self, reservation: &Reservation) -> Result<(), StorageError>;
    fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, StorageError>;
    fn contains(&self, id: &ReservationId) -> Result<bool, StorageError>;
    fn list_room(&self, room: &RoomId) -> Result<Vec<Reservation>, StorageError>;
    fn list_all(&self) -> Result<Vec<Reservation>, StorageError>;
    /// Replace an existing row, returning false when the id is unknown
    fn update(&self, reservation: &Reservation) -> Result<bool, StorageError>;
}

#[derive(Default)]
pub struct InMemoryBackend {
    rows: RwLock<FxHashMap<ReservationId, Reservation>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReservationBackend for InMemoryBackend {
    fn insert(&self, reservation: &Reservation) -> Result<(), StorageError> {
        let mut rows = self.rows.write();
        if rows.contains_key(&reservation.id) {
            return Err(StorageError::Duplicate(reservation.id.clone()));
        }
        rows.insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }

    fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, StorageError> {
        Ok(self.rows.read().get(id).cloned())
    }

    fn contains(&self, id: &ReservationId) -> Result<bool, StorageError> {
        Ok(self.rows.read().contains_key(id))
    }

    fn list_room(&self, room: &RoomId) -> Result<Vec<Reservation>, StorageError> {
        Ok(self.rows.read().values().filter(|r| &r.room_id == room).cloned().collect())
    }

    fn list_all(&self) -> Result<Vec<Reservation>, StorageError> {
        Ok(self.rows.read().values().cloned().collect())
    }

    fn update(&self, reservation: &Reservation) -> Result<bool, StorageError> {
        let mut rows = self.rows.write();
        match rows.get_mut(&reservation.id) {
            Some(row) => {
                *row = reservation.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct ReservationStore<B: ReservationBackend = InMemoryBackend> {
    backend: B,
    buffer: chrono::Duration,
    offset: FixedOffset,
    /// Serializes read-check-write sequences across all rooms
    write_lock: Mutex<()>,
}

impl ReservationStore<InMemoryBackend> {
    pub fn in_memory(buffer: chrono::Duration, offset: FixedOffset) -> Self {
        Self::new(InMemoryBackend::new(), buffer, offset)
    }
}

impl<B: ReservationBackend> ReservationStore<B> {
    pub fn new(backend: B, buffer: chrono::Duration, offset: FixedOffset) -> Self {
        Self { backend, buffer, offset, write_lock: Mutex::new(()) }
    }

    pub fn buffer(&self) -> chrono::Duration {
        self.buffer
    }

    /// Create an ACTIVE reservation
    ///
    /// Without an explicit id, one is derived as `{room}-{unix_start}` and
    /// suffixed `-1`, `-2`, ... until unused.
    pub fn create<Tz: TimeZone>(
        &self,
        room: &RoomId,
        user: &UserId,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
        id: Option<ReservationId>,
    ) -> Result<Reservation, ReservationError> {
        let start = start.with_timezone(&self.offset);
        let end = end.with_timezone(&self.offset);
        if end <= start {
            return Err(ReservationError::Validation(format!(
                "end {} must be after start {}",
                end, start
            )));
        }

        let _guard = self.write_lock.lock();

        let existing = self.backend.list_room(room)?;
        self.check_conflicts(&existing, start, end, None)?;

        let id = match id {
            Some(id) => id,
            None => self.generate_id(room, start)?,
        };

        let reservation = Reservation {
            id,
            room_id: room.clone(),
            user_id: user.clone(),
            start,
            end,
            status: ReservationStatus::Active,
        };
        self.backend.insert(&reservation)?;

        info!(
            reservation_id = %reservation.id,
            room_id = %room,
            user_id = %user,
            start = %start,
            end = %end,
            "reservation_created"
        );
        Ok(reservation)
    }

    pub fn get_by_id(&self, id: &ReservationId) -> Result<Option<Reservation>, ReservationError> {
        Ok(self.backend.get(id)?)
    }

    pub fn require(&self, id: &ReservationId) -> Result<Reservation, ReservationError> {
        self.get_by_id(id)?.ok_or_else(|| ReservationError::NotFound(id.clone()))
    }

    /// All reservations for the room, ordered by start time
    pub fn list_for_room(&self, room: &RoomId) -> Result<Vec<Reservation>, ReservationError> {
        let mut list = self.backend.list_room(room)?;
        list.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    pub fn list_all(&self) -> Result<Vec<Reservation>, ReservationError> {
        let mut list = self.backend.list_all()?;
        list.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    /// The ACTIVE or USED reservation whose `[start, end]` contains `now`
    pub fn get_active(
        &self,
        room: &RoomId,
        now: Timestamp,
    ) -> Result<Option<Reservation>, ReservationError> {
        Ok(self.list_for_room(room)?.into_iter().find(|r| {
            matches!(r.status, ReservationStatus::Active | ReservationStatus::Used)
                && r.contains(now)
        }))
    }

    pub fn mark_used(&self, id: &ReservationId) -> Result<bool, ReservationError> {
        self.transition(id, ReservationStatus::Used)
    }

    pub fn mark_no_show(&self, id: &ReservationId) -> Result<bool, ReservationError> {
        self.transition(id, ReservationStatus::NoShow)
    }

    pub fn cancel(&self, id: &ReservationId) -> Result<bool, ReservationError> {
        self.transition(id, ReservationStatus::Cancelled)
    }

    /// Push `end` later by `minutes`, keeping the buffer invariant
    pub fn extend(&self, id: &ReservationId, minutes: i64) -> Result<Reservation, ReservationError> {
        if minutes <= 0 {
            return Err(ReservationError::Validation(format!(
                "extension must be positive, got {} minutes",
                minutes
            )));
        }

        let _guard = self.write_lock.lock();

        let mut reservation =
            self.backend.get(id)?.ok_or_else(|| ReservationError::NotFound(id.clone()))?;
        if reservation.status == ReservationStatus::Cancelled {
            return Err(ReservationError::Validation(format!(
                "reservation {} is cancelled",
                id
            )));
        }

        let new_end = reservation.end + chrono::Duration::minutes(minutes);
        let existing = self.backend.list_room(&reservation.room_id)?;
        self.check_conflicts(&existing, reservation.start, new_end, Some(id))?;

        reservation.end = new_end;
        if !self.backend.update(&reservation)? {
            return Err(ReservationError::NotFound(id.clone()));
        }

        info!(
            reservation_id = %id,
            room_id = %reservation.room_id,
            new_end = %new_end,
            extend_min = %minutes,
            "reservation_extended"
        );
        Ok(reservation)
    }

    fn transition(
        &self,
        id: &ReservationId,
        target: ReservationStatus,
    ) -> Result<bool, ReservationError> {
        let _guard = self.write_lock.lock();

        let Some(mut reservation) = self.backend.get(id)? else {
            debug!(reservation_id = %id, target = %target, "reservation_transition_unknown_id");
            return Ok(false);
        };
        if reservation.status == target {
            return Ok(false);
        }
        if reservation.status.is_terminal() {
            warn!(
                reservation_id = %id,
                from = %reservation.status,
                target = %target,
                "reservation_transition_rejected"
            );
            return Ok(false);
        }

        reservation.status = target;
        let changed = self.backend.update(&reservation)?;
        if changed {
            info!(reservation_id = %id, status = %target, "reservation_status_changed");
        }
        Ok(changed)
    }

    fn check_conflicts(
        &self,
        existing: &[Reservation],
        start: Timestamp,
        end: Timestamp,
        skip: Option<&ReservationId>,
    ) -> Result<(), ReservationError> {
        let conflict = existing.iter().find(|r| {
            r.status != ReservationStatus::Cancelled
                && Some(&r.id) != skip
                && r.collides_with(start, end, self.buffer)
        });
        match conflict {
            Some(r) => {
                debug!(
                    existing = %r.id,
                    existing_start = %r.start,
                    existing_end = %r.end,
                    start = %start,
                    end = %end,
                    buffer_min = %self.buffer.num_minutes(),
                    "reservation_conflict"
                );
                Err(ReservationError::Conflict { existing: r.id.clone() })
            }
            None => Ok(()),
        }
    }

    fn generate_id(&self, room: &RoomId, start: Timestamp) -> Result<ReservationId, StorageError> {
        let base = format!("{}-{}", room, start.timestamp());
        let mut candidate = ReservationId(base.clone());
        let mut suffix = 1u32;
        while self.backend.contains(&candidate)? {
            candidate = ReservationId(format!("{}-{}", base, suffix));
            suffix += 1;
        }
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn at(hour: u32, min: u32) -> Timestamp {
        offset().with_ymd_and_hms(2026, 4, 1, hour, min, 0).unwrap()
    }

    fn store() -> ReservationStore {
        ReservationStore::in_memory(chrono::Duration::minutes(5), offset())
    }

    fn room() -> RoomId {
        RoomId::from("room-a")
    }

    fn user() -> UserId {
        UserId::from("alice")
    }

    /// Backend whose existence probe never sees the row, so only insert catches duplicates
    struct BlindBackend(InMemoryBackend);

    impl ReservationBackend for BlindBackend {
        fn insert(&self, reservation: &Reservation) -> Result<(), StorageError> {
            self.0.insert(reservation)
        }
        fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, StorageError> {
            self.0.get(id)
        }
        fn contains(&self, _id: &ReservationId) -> Result<bool, StorageError> {
            Ok(false)
        }
        fn list_room(&self, _room: &RoomId) -> Result<Vec<Reservation>, StorageError> {
            Ok(Vec::new())
        }
        fn list_all(&self) -> Result<Vec<Reservation>, StorageError> {
            self.0.list_all()
        }
        fn update(&self, reservation: &Reservation) -> Result<bool, StorageError> {
            self.0.update(reservation)
        }
    }

    #[test]
    fn test_create_then_get() {
        let store = store();
        let created = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();

        let fetched = store.get_by_id(&created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.status, ReservationStatus::Active);
        assert_eq!(fetched.id.as_str(), format!("room-a-{}", at(10, 0).timestamp()));
    }

    #[test]
    fn test_create_normalizes_zone() {
        let store = store();
        let utc_start = at(10, 0).with_timezone(&chrono::Utc);
        let utc_end = at(11, 0).with_timezone(&chrono::Utc);

        let created = store.create(&room(), &user(), utc_start, utc_end, None).unwrap();
        assert_eq!(created.start.offset().local_minus_utc(), 9 * 3600);
        assert_eq!(created.start, at(10, 0));
    }

    #[test]
    fn test_rejects_empty_or_inverted_range() {
        let store = store();
        let err = store.create(&room(), &user(), at(10, 0), at(10, 0), None).unwrap_err();
        assert!(matches!(err, ReservationError::Validation(_)));
        let err = store.create(&room(), &user(), at(11, 0), at(10, 0), None).unwrap_err();
        assert!(matches!(err, ReservationError::Validation(_)));
        assert!(store.list_for_room(&room()).unwrap().is_empty());
    }

    #[test]
    fn test_conflict_inside_buffer() {
        let store = store();
        let first = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();

        let err = store
            .create(&room(), &UserId::from("bob"), at(11, 4), at(12, 0), None)
            .unwrap_err();
        match err {
            ReservationError::Conflict { existing } => assert_eq!(existing, first.id),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.list_for_room(&room()).unwrap().len(), 1);

        store.create(&room(), &UserId::from("bob"), at(11, 5), at(12, 0), None).unwrap();
        store.create(&room(), &UserId::from("carol"), at(9, 0), at(9, 55), None).unwrap();
    }

    #[test]
    fn test_other_rooms_do_not_conflict() {
        let store = store();
        store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();
        store.create(&RoomId::from("room-b"), &user(), at(10, 0), at(11, 0), None).unwrap();
    }

    #[test]
    fn test_cancelled_frees_slot_and_id_gets_suffix() {
        let store = store();
        let first = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();
        assert!(store.cancel(&first.id).unwrap());

        let second = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();
        assert_eq!(second.id.as_str(), format!("{}-1", first.id));

        store.cancel(&second.id).unwrap();
        let third = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();
        assert_eq!(third.id.as_str(), format!("{}-2", first.id));
    }

    #[test]
    fn test_duplicate_explicit_id_is_conflict() {
        let store = store();
        let id = ReservationId::from("fixed");
        store.create(&room(), &user(), at(10, 0), at(11, 0), Some(id.clone())).unwrap();

        let err = store
            .create(&RoomId::from("room-b"), &user(), at(10, 0), at(11, 0), Some(id.clone()))
            .unwrap_err();
        assert!(matches!(err, ReservationError::Conflict { existing } if existing == id));
    }

    #[test]
    fn test_backend_uniqueness_violation_maps_to_conflict() {
        let store = ReservationStore::new(
            BlindBackend(InMemoryBackend::new()),
            chrono::Duration::minutes(5),
            offset(),
        );
        store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();

        let err = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap_err();
        assert!(matches!(err, ReservationError::Conflict { .. }));
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_list_sorted_by_start() {
        let store = store();
        store.create(&room(), &user(), at(14, 0), at(15, 0), None).unwrap();
        store.create(&room(), &user(), at(9, 0), at(10, 0), None).unwrap();
        store.create(&room(), &user(), at(11, 0), at(12, 0), None).unwrap();

        let starts: Vec<_> = store.list_for_room(&room()).unwrap().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![at(9, 0), at(11, 0), at(14, 0)]);
    }

    #[test]
    fn test_get_active() {
        let store = store();
        let r = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();

        assert!(store.get_active(&room(), at(9, 59)).unwrap().is_none());
        assert_eq!(store.get_active(&room(), at(10, 0)).unwrap().unwrap().id, r.id);
        store.mark_used(&r.id).unwrap();
        assert_eq!(store.get_active(&room(), at(11, 0)).unwrap().unwrap().id, r.id);
        assert!(store.get_active(&room(), at(11, 1)).unwrap().is_none());
    }

    #[test]
    fn test_no_show_is_not_active() {
        let store = store();
        let r = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();
        store.mark_no_show(&r.id).unwrap();
        assert!(store.get_active(&room(), at(10, 30)).unwrap().is_none());
    }

    #[test]
    fn test_transitions_are_idempotent_and_one_way() {
        let store = store();
        let r = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();

        assert!(store.mark_used(&r.id).unwrap());
        assert!(!store.mark_used(&r.id).unwrap());
        assert!(!store.mark_no_show(&r.id).unwrap());
        assert!(!store.cancel(&r.id).unwrap());
        assert_eq!(store.require(&r.id).unwrap().status, ReservationStatus::Used);

        assert!(!store.mark_used(&ReservationId::from("missing")).unwrap());
    }

    #[test]
    fn test_extend() {
        let store = store();
        let r = store.create(&room(), &user(), at(10, 0), at(11, 0), None).unwrap();
        store.create(&room(), &user(), at(12, 0), at(13, 0), None).unwrap();

        let extended = store.extend(&r.id, 15).unwrap();
        assert_eq!(extended.end, at(11, 15));
        assert_eq!(store.require(&r.id).unwrap().end, at(11, 15));

        let err = store.extend(&r.id, 45).unwrap_err();
        assert!(matches!(err, ReservationError::Conflict { .. }));
        assert_eq!(store.require(&r.id).unwrap().end, at(11, 15));

        assert!(matches!(store.extend(&r.id, 0), Err(ReservationError::Validation(_))));
        assert!(matches!(
            store.extend(&ReservationId::from("nope"), 15),
            Err(ReservationError::NotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_creates_keep_invariant() {
        use std::sync::Arc;

        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let user = UserId(format!("u{i}"));
                    store.create(&room(), &user, at(10, 0), at(11, 0), None).is_ok()
                })
            })
            .collect();

        let successes = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(successes, 1);
        assert_eq!(store.list_for_room(&room()).unwrap().len(), 1);
    }
}
