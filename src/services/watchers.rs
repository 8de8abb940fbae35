//! Periodic deadline watchers
//!
//! The no-show watcher and end watcher scan a board of reservation entries
//! independently of sensor ticks. Each side effect is claimed through a
//! one-shot flag on the board first, so repeated scans never duplicate an
//! action. Collaborator notifications are spawned and never awaited by the
//! scan itself.

use crate::domain::clock::Clock;
use crate::domain::error::ReservationError;
use crate::domain::types::{Reservation, ReservationId, ReservationStatus, RoomId, Timestamp};
use crate::infra::metrics::Metrics;
use crate::io::kpi::{KpiEvent, KpiLog};
use crate::io::room_services::RoomServices;
use crate::services::occupancy::OccupancyBoard;
use crate::services::reservation_store::{ReservationBackend, ReservationStore};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Reason recorded when the end watcher closes an empty room
pub const CLOSE_REASON_ZERO_OCCUPANCY: &str = "zero_occupancy_near_end";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    pub interval: Duration,
    pub arrival_after: chrono::Duration,
    pub no_show_grace: chrono::Duration,
    pub end_close_window: chrono::Duration,
    pub overstay_grace: chrono::Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            arrival_after: chrono::Duration::minutes(15),
            no_show_grace: chrono::Duration::minutes(7),
            end_close_window: chrono::Duration::minutes(5),
            overstay_grace: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub reservation_id: ReservationId,
    pub room_id: RoomId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub checked_in: bool,
    pub auto_released: bool,
    pub closed: bool,
    pub overstayed: bool,
}

impl WatchEntry {
    fn from_reservation(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id.clone(),
            room_id: r.room_id.clone(),
            start: r.start,
            end: r.end,
            checked_in: r.status == ReservationStatus::Used,
            auto_released: false,
            closed: false,
            overstayed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFlag {
    CheckedIn,
    AutoReleased,
    Closed,
    Overstayed,
}

#[derive(Default)]
struct BoardInner {
    entries: FxHashMap<ReservationId, WatchEntry>,
    /// Pruned entries, kept out of every scan
    retired: FxHashMap<ReservationId, WatchEntry>,
}

/// Watcher-side view of reservations with their one-shot flags
#[derive(Default)]
pub struct WatchBoard {
    inner: Mutex<BoardInner>,
}

impl WatchBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the board in line with the store
    ///
    /// Times follow the store, flags survive. Cancelled reservations leave
    /// the board and retired ones stay off it. Returns the number of tracked
    /// entries.
    pub fn sync_from<B: ReservationBackend>(
        &self,
        store: &ReservationStore<B>,
    ) -> Result<usize, ReservationError> {
        let reservations = store.list_all()?;
        let mut inner = self.inner.lock();
        let BoardInner { entries, retired } = &mut *inner;
        for r in &reservations {
            if r.status == ReservationStatus::Cancelled {
                entries.remove(&r.id);
                continue;
            }
            if retired.contains_key(&r.id) {
                continue;
            }
            let entry =
                entries.entry(r.id.clone()).or_insert_with(|| WatchEntry::from_reservation(r));
            entry.start = r.start;
            entry.end = r.end;
            if r.status == ReservationStatus::Used {
                entry.checked_in = true;
            }
        }
        Ok(entries.len())
    }

    /// Retire entries no watcher can act on any more
    ///
    /// An entry goes once it was auto-released, or once `now` is past
    /// `end + settle` with its end flags settled (closed or overstayed).
    /// Returns the number of entries removed.
    pub fn prune(&self, now: Timestamp, settle: chrono::Duration) -> usize {
        let mut inner = self.inner.lock();
        let BoardInner { entries, retired } = &mut *inner;
        let done: Vec<ReservationId> = entries
            .values()
            .filter(|e| e.auto_released || (now > e.end + settle && (e.closed || e.overstayed)))
            .map(|e| e.reservation_id.clone())
            .collect();
        for id in &done {
            if let Some(entry) = entries.remove(id) {
                retired.insert(entry.reservation_id.clone(), entry);
            }
        }
        done.len()
    }

    /// Put a retired entry back on the board with its flags
    ///
    /// Auto-released entries never come back.
    pub fn readmit(&self, id: &ReservationId) -> bool {
        let mut inner = self.inner.lock();
        let BoardInner { entries, retired } = &mut *inner;
        if !retired.get(id).is_some_and(|e| !e.auto_released) {
            return false;
        }
        match retired.remove(id) {
            Some(entry) => {
                entries.insert(id.clone(), entry);
                true
            }
            None => false,
        }
    }

    pub fn is_retired(&self, id: &ReservationId) -> bool {
        self.inner.lock().retired.contains_key(id)
    }

    pub fn get(&self, id: &ReservationId) -> Option<WatchEntry> {
        self.inner.lock().entries.get(id).cloned()
    }

    /// Entries ordered by start, then id
    pub fn snapshot(&self) -> Vec<WatchEntry> {
        let mut all: Vec<WatchEntry> = self.inner.lock().entries.values().cloned().collect();
        all.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.reservation_id.cmp(&b.reservation_id)));
        all
    }

    /// Set a flag if it was clear; true when this call set it
    pub fn try_flag(&self, id: &ReservationId, flag: WatchFlag) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        let slot = match flag {
            WatchFlag::CheckedIn => &mut entry.checked_in,
            WatchFlag::AutoReleased => &mut entry.auto_released,
            WatchFlag::Closed => &mut entry.closed,
            WatchFlag::Overstayed => &mut entry.overstayed,
        };
        if *slot {
            return false;
        }
        *slot = true;
        true
    }

    pub fn record_checkin(&self, id: &ReservationId) -> bool {
        self.try_flag(id, WatchFlag::CheckedIn)
    }

    /// Move the end of an extended reservation and re-arm its end flags
    pub fn rearm_end(&self, id: &ReservationId, new_end: Timestamp) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        entry.end = new_end;
        entry.closed = false;
        entry.overstayed = false;
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchActionKind {
    AutoRelease,
    Close,
    Overstay { occupancy: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchAction {
    pub kind: WatchActionKind,
    pub reservation_id: ReservationId,
    pub room_id: RoomId,
}

impl WatchAction {
    fn new(kind: WatchActionKind, entry: &WatchEntry) -> Self {
        Self { kind, reservation_id: entry.reservation_id.clone(), room_id: entry.room_id.clone() }
    }
}

pub struct NoShowWatcher {
    arrival_after: chrono::Duration,
    no_show_grace: chrono::Duration,
}

impl NoShowWatcher {
    pub fn new(settings: &WatcherSettings) -> Self {
        Self { arrival_after: settings.arrival_after, no_show_grace: settings.no_show_grace }
    }

    pub fn deadline(&self, entry: &WatchEntry) -> Timestamp {
        entry.start + self.arrival_after + self.no_show_grace
    }

    /// Claim every entry at or past its deadline that never checked in
    pub fn scan(&self, board: &WatchBoard, now: Timestamp) -> Vec<WatchAction> {
        board
            .snapshot()
            .into_iter()
            .filter(|e| !e.checked_in && !e.auto_released && now >= self.deadline(e))
            .filter(|e| board.try_flag(&e.reservation_id, WatchFlag::AutoReleased))
            .map(|e| WatchAction::new(WatchActionKind::AutoRelease, &e))
            .collect()
    }
}

pub struct EndWatcher {
    end_close_window: chrono::Duration,
    overstay_grace: chrono::Duration,
}

impl EndWatcher {
    pub fn new(settings: &WatcherSettings) -> Self {
        Self { end_close_window: settings.end_close_window, overstay_grace: settings.overstay_grace }
    }

    pub fn scan(
        &self,
        board: &WatchBoard,
        occupancy: &OccupancyBoard,
        now: Timestamp,
    ) -> Vec<WatchAction> {
        let mut actions = Vec::new();
        for entry in board.snapshot().into_iter().filter(|e| !e.auto_released) {
            let occ = occupancy.occupancy(&entry.room_id);

            let near_end = entry.end - self.end_close_window <= now
                && now <= entry.end + self.end_close_window;
            if !entry.closed
                && near_end
                && occ == 0
                && board.try_flag(&entry.reservation_id, WatchFlag::Closed)
            {
                actions.push(WatchAction::new(WatchActionKind::Close, &entry));
            }

            if !entry.overstayed
                && now >= entry.end + self.overstay_grace
                && occ > 0
                && board.try_flag(&entry.reservation_id, WatchFlag::Overstayed)
            {
                actions.push(WatchAction::new(WatchActionKind::Overstay { occupancy: occ }, &entry));
            }
        }
        actions
    }
}

/// Shared handles the watcher loops run against
#[derive(Clone)]
pub struct Watchers {
    pub settings: WatcherSettings,
    pub store: Arc<ReservationStore>,
    pub board: Arc<WatchBoard>,
    pub occupancy: Arc<OccupancyBoard>,
    pub services: Arc<dyn RoomServices>,
    pub kpi: Arc<KpiLog>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<Clock>,
}

impl Watchers {
    /// One no-show pass: sync, claim, record KPI
    pub fn no_show_cycle(&self, now: Timestamp) -> Result<Vec<WatchAction>, ReservationError> {
        self.board.sync_from(&self.store)?;
        let actions = NoShowWatcher::new(&self.settings).scan(&self.board, now);
        for action in &actions {
            warn!(
                room_id = %action.room_id,
                reservation_id = %action.reservation_id,
                ts = %now.to_rfc3339(),
                "no_show_auto_release"
            );
            self.metrics.record_auto_release();
            self.kpi.write(
                &action.room_id,
                now,
                &KpiEvent::NoShowDetected {
                    reservation_id: action.reservation_id.clone(),
                    arrival_window_after_min: self.settings.arrival_after.num_minutes(),
                    no_show_grace_min: self.settings.no_show_grace.num_minutes(),
                },
            );
        }
        self.prune(now);
        Ok(actions)
    }

    /// One end-of-session pass: sync, claim, record KPI
    pub fn end_cycle(&self, now: Timestamp) -> Result<Vec<WatchAction>, ReservationError> {
        self.board.sync_from(&self.store)?;
        let actions = EndWatcher::new(&self.settings).scan(&self.board, &self.occupancy, now);
        for action in &actions {
            match action.kind {
                WatchActionKind::Close => {
                    info!(
                        room_id = %action.room_id,
                        reservation_id = %action.reservation_id,
                        ts = %now.to_rfc3339(),
                        "session_closed"
                    );
                    self.metrics.record_session_closed();
                    self.kpi.write(
                        &action.room_id,
                        now,
                        &KpiEvent::ReservationClosed {
                            reservation_id: action.reservation_id.clone(),
                            reason: CLOSE_REASON_ZERO_OCCUPANCY,
                            end_close_window_min: self.settings.end_close_window.num_minutes(),
                        },
                    );
                }
                WatchActionKind::Overstay { occupancy } => {
                    warn!(
                        room_id = %action.room_id,
                        reservation_id = %action.reservation_id,
                        occupancy = %occupancy,
                        ts = %now.to_rfc3339(),
                        "overstay_detected"
                    );
                    self.metrics.record_overstay_detected();
                    self.kpi.write(
                        &action.room_id,
                        now,
                        &KpiEvent::OverstayDetected {
                            reservation_id: action.reservation_id.clone(),
                            overstay_grace_min: self.settings.overstay_grace.num_minutes(),
                            occupancy,
                        },
                    );
                }
                WatchActionKind::AutoRelease => {}
            }
        }
        self.prune(now);
        Ok(actions)
    }

    fn prune(&self, now: Timestamp) {
        let settle = self.settings.end_close_window.max(self.settings.overstay_grace);
        let pruned = self.board.prune(now, settle);
        if pruned > 0 {
            debug!(pruned = %pruned, remaining = %self.board.len(), "watch_board_pruned");
        }
    }

    /// Extend a reservation and re-arm its end-of-session flags
    pub fn extend(
        &self,
        id: &ReservationId,
        minutes: i64,
    ) -> Result<Reservation, ReservationError> {
        let updated = self.store.extend(id, minutes)?;
        self.board.readmit(id);
        self.board.sync_from(&self.store)?;
        self.board.rearm_end(id, updated.end);
        let now = self.clock.now();
        info!(
            room_id = %updated.room_id,
            reservation_id = %id,
            new_end = %updated.end.to_rfc3339(),
            "reservation_extended"
        );
        self.kpi.write(
            &updated.room_id,
            now,
            &KpiEvent::ReservationExtended {
                reservation_id: id.clone(),
                new_end: updated.end,
                extend_min: minutes,
            },
        );
        Ok(updated)
    }

    /// Fire collaborator notifications for claimed actions
    ///
    /// Handles are returned for callers that want to wait; the loops drop
    /// them.
    pub fn notify_all(&self, actions: &[WatchAction]) -> Vec<JoinHandle<()>> {
        actions
            .iter()
            .cloned()
            .map(|action| {
                let this = self.clone();
                tokio::spawn(async move { this.notify(action).await })
            })
            .collect()
    }

    async fn notify(&self, action: WatchAction) {
        let started = Instant::now();
        let (call, result) = match action.kind {
            WatchActionKind::AutoRelease => {
                let released =
                    self.services.auto_release(&action.reservation_id, &action.room_id).await;
                let revoked =
                    self.services.revoke_lock(&action.reservation_id, &action.room_id).await;
                ("auto_release", released.and(revoked))
            }
            WatchActionKind::Close => (
                "revoke_lock",
                self.services.revoke_lock(&action.reservation_id, &action.room_id).await,
            ),
            WatchActionKind::Overstay { occupancy } => (
                "report_overstay",
                self.services
                    .report_overstay(&action.reservation_id, &action.room_id, occupancy)
                    .await,
            ),
        };
        self.metrics.record_service_latency(started.elapsed().as_millis() as u64);
        match result {
            Ok(()) => debug!(
                room_id = %action.room_id,
                reservation_id = %action.reservation_id,
                call = %call,
                "collaborator_notified"
            ),
            Err(e) => {
                self.metrics.record_service_error();
                warn!(
                    room_id = %action.room_id,
                    reservation_id = %action.reservation_id,
                    call = %call,
                    error = %e,
                    "collaborator_call_failed"
                );
            }
        }
    }

    pub async fn run_no_show_watcher(self, shutdown: watch::Receiver<bool>) {
        self.run_loop("no_show_watcher", shutdown, Self::no_show_cycle).await;
    }

    pub async fn run_end_watcher(self, shutdown: watch::Receiver<bool>) {
        self.run_loop("end_watcher", shutdown, Self::end_cycle).await;
    }

    async fn run_loop(
        &self,
        name: &'static str,
        mut shutdown: watch::Receiver<bool>,
        cycle: fn(&Self, Timestamp) -> Result<Vec<WatchAction>, ReservationError>,
    ) {
        info!(
            watcher = %name,
            interval_secs = %self.settings.interval.as_secs(),
            "watcher_started"
        );
        let mut timer = interval(self.settings.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(watcher = %name, "watcher_shutdown");
                        return;
                    }
                }
                _ = timer.tick() => {}
            }

            let now = self.clock.now();
            match cycle(self, now) {
                Ok(actions) => {
                    if !actions.is_empty() {
                        self.notify_all(&actions);
                    }
                }
                Err(e) => {
                    self.metrics.record_watcher_error();
                    error!(watcher = %name, ts = %now.to_rfc3339(), error = %e, "watcher_cycle_failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::room_services::{MockRoomServices, ServiceCall};
    use crate::domain::types::{CrossingEvent, CrossingKind};
    use chrono::{FixedOffset, TimeZone};

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn at(hour: u32, min: u32) -> Timestamp {
        offset().with_ymd_and_hms(2026, 4, 1, hour, min, 0).unwrap()
    }

    fn room() -> RoomId {
        RoomId::from("room-a")
    }

    fn fixture() -> (Watchers, Arc<MockRoomServices>) {
        let services = Arc::new(MockRoomServices::new());
        let watchers = Watchers {
            settings: WatcherSettings::default(),
            store: Arc::new(ReservationStore::in_memory(chrono::Duration::minutes(5), offset())),
            board: Arc::new(WatchBoard::new()),
            occupancy: Arc::new(OccupancyBoard::new()),
            services: services.clone(),
            kpi: Arc::new(KpiLog::disabled("treatment")),
            metrics: Arc::new(Metrics::new()),
            clock: Arc::new(Clock::with_offset(offset())),
        };
        (watchers, services)
    }

    fn enter(watchers: &Watchers) {
        watchers
            .occupancy
            .counter(&room())
            .apply(&CrossingEvent { kind: CrossingKind::Enter, confidence: 1.0 }, 0.9);
    }

    #[test]
    fn test_sync_preserves_flags_and_drops_cancelled() {
        let (w, _) = fixture();
        let a = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        let b = w.store.create(&room(), &"bob".into(), at(12, 0), at(13, 0), None).unwrap();

        assert_eq!(w.board.sync_from(&w.store).unwrap(), 2);
        assert!(w.board.try_flag(&a.id, WatchFlag::Closed));
        assert!(!w.board.try_flag(&a.id, WatchFlag::Closed));

        w.store.cancel(&b.id).unwrap();
        w.store.mark_used(&a.id).unwrap();
        assert_eq!(w.board.sync_from(&w.store).unwrap(), 1);

        let entry = w.board.get(&a.id).unwrap();
        assert!(entry.closed);
        assert!(entry.checked_in);
        assert!(w.board.get(&b.id).is_none());
    }

    #[test]
    fn test_no_show_deadline() {
        let (w, _) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();

        assert!(w.no_show_cycle(at(10, 21)).unwrap().is_empty());
        let actions = w.no_show_cycle(at(10, 22)).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, WatchActionKind::AutoRelease);
        assert_eq!(actions[0].reservation_id, r.id);

        assert!(w.no_show_cycle(at(10, 30)).unwrap().is_empty());
        assert_eq!(w.metrics.auto_releases(), 1);
    }

    #[test]
    fn test_checked_in_is_never_released() {
        let (w, _) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        assert!(w.board.record_checkin(&r.id));

        assert!(w.no_show_cycle(at(10, 40)).unwrap().is_empty());
    }

    #[test]
    fn test_end_close_exactly_once() {
        let (w, _) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        w.board.record_checkin(&r.id);

        assert!(w.end_cycle(at(10, 54)).unwrap().is_empty());
        let actions = w.end_cycle(at(10, 55)).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, WatchActionKind::Close);

        for min in 56..60 {
            assert!(w.end_cycle(at(10, min)).unwrap().is_empty());
        }
        assert_eq!(w.metrics.sessions_closed(), 1);
    }

    #[test]
    fn test_overstay_exactly_once() {
        let (w, _) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        w.board.record_checkin(&r.id);
        enter(&w);

        assert!(w.end_cycle(at(11, 4)).unwrap().is_empty());
        let actions = w.end_cycle(at(11, 5)).unwrap();
        assert_eq!(actions, vec![WatchAction {
            kind: WatchActionKind::Overstay { occupancy: 1 },
            reservation_id: r.id.clone(),
            room_id: room(),
        }]);

        for min in 6..30 {
            assert!(w.end_cycle(at(11, min)).unwrap().is_empty());
        }
        assert_eq!(w.metrics.overstays_detected(), 1);
    }

    #[test]
    fn test_extend_rearms_end_flags() {
        let (w, _) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        w.board.record_checkin(&r.id);
        assert_eq!(w.end_cycle(at(11, 0)).unwrap().len(), 1);

        let updated = w.extend(&r.id, 30).unwrap();
        assert_eq!(updated.end, at(11, 30));
        let entry = w.board.get(&r.id).unwrap();
        assert!(!entry.closed);
        assert_eq!(entry.end, at(11, 30));

        assert!(w.end_cycle(at(11, 5)).unwrap().is_empty());
        assert_eq!(w.end_cycle(at(11, 25)).unwrap().len(), 1);
    }

    #[test]
    fn test_auto_released_skips_end_watcher() {
        let (w, _) = fixture();
        w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        assert_eq!(w.no_show_cycle(at(10, 30)).unwrap().len(), 1);
        assert!(w.end_cycle(at(11, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_prune_retires_settled_entries() {
        let (w, _) = fixture();
        let released = w.store.create(&room(), &"alice".into(), at(9, 0), at(9, 30), None).unwrap();
        let closed = w.store.create(&room(), &"bob".into(), at(10, 0), at(11, 0), None).unwrap();
        let open = w.store.create(&room(), &"carol".into(), at(12, 0), at(13, 0), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        w.board.record_checkin(&closed.id);
        w.board.record_checkin(&open.id);

        assert_eq!(w.no_show_cycle(at(9, 22)).unwrap().len(), 1);
        assert!(w.board.get(&released.id).is_none());
        assert!(w.board.is_retired(&released.id));

        assert_eq!(w.end_cycle(at(11, 0)).unwrap().len(), 1);
        // still inside end + max(close window, overstay grace)
        assert!(w.end_cycle(at(11, 5)).unwrap().is_empty());
        assert!(w.board.get(&closed.id).is_some());
        assert!(w.end_cycle(at(11, 6)).unwrap().is_empty());
        assert!(w.board.get(&closed.id).is_none());

        // later syncs never resurrect retired entries
        assert_eq!(w.board.sync_from(&w.store).unwrap(), 1);
        assert!(w.board.get(&open.id).is_some());
    }

    #[test]
    fn test_unsettled_entry_is_kept_past_end() {
        let (w, _) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        w.board.record_checkin(&r.id);

        // nobody ever left or stayed while the watcher looked
        assert_eq!(w.board.prune(at(12, 0), chrono::Duration::minutes(5)), 0);
        assert!(w.board.get(&r.id).is_some());
    }

    #[test]
    fn test_extend_readmits_closed_entry_only() {
        let (w, _) = fixture();
        let closed = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();
        let released = w.store.create(&room(), &"bob".into(), at(12, 0), at(12, 30), None).unwrap();
        w.board.sync_from(&w.store).unwrap();
        w.board.record_checkin(&closed.id);

        assert_eq!(w.end_cycle(at(11, 0)).unwrap().len(), 1);
        assert!(w.end_cycle(at(11, 6)).unwrap().is_empty());
        assert!(w.board.is_retired(&closed.id));

        w.extend(&closed.id, 30).unwrap();
        let entry = w.board.get(&closed.id).unwrap();
        assert_eq!(entry.end, at(11, 30));
        assert!(entry.checked_in);
        assert!(!entry.closed);

        assert_eq!(w.no_show_cycle(at(12, 22)).unwrap().len(), 1);
        assert!(!w.board.readmit(&released.id));
        assert!(w.board.is_retired(&released.id));
    }

    #[tokio::test]
    async fn test_notifications_reach_collaborators() {
        let (w, services) = fixture();
        let r = w.store.create(&room(), &"alice".into(), at(10, 0), at(11, 0), None).unwrap();

        let actions = w.no_show_cycle(at(10, 30)).unwrap();
        for handle in w.notify_all(&actions) {
            handle.await.unwrap();
        }

        assert_eq!(
            services.calls(),
            vec![
                ServiceCall::AutoRelease(r.id.clone(), room()),
                ServiceCall::RevokeLock(r.id, room()),
            ]
        );
        assert_eq!(w.metrics.service_errors(), 0);
    }
}
