//! Sensor poller - detection frames to occupancy
//!
//! Each poll fetches one frame, runs it through the line tracker and applies
//! the resulting crossings to the room's occupancy counter. An accepted enter
//! also attempts a check-in against the reservation collaborator.

use crate::domain::clock::Clock;
use crate::domain::types::{CrossingEvent, CrossingKind, ReservationId, RoomId, Timestamp};
use crate::infra::metrics::Metrics;
use crate::io::kpi::{KpiEvent, KpiLog, CHECKIN_METHOD_QR};
use crate::io::room_services::{CheckinResult, RoomServices};
use crate::io::sensor::DetectionSource;
use crate::services::line_tracker::LineTracker;
use crate::services::occupancy::{CrossingOutcome, OccupancyCounter};
use crate::services::watchers::WatchBoard;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Window parameters echoed into enter KPI records
#[derive(Debug, Clone, Copy)]
pub struct ArrivalWindows {
    pub before: chrono::Duration,
    pub after: chrono::Duration,
    pub no_show_grace: chrono::Duration,
}

#[derive(Clone)]
pub struct CrossingProcessor {
    room_id: RoomId,
    counter: Arc<OccupancyCounter>,
    board: Arc<WatchBoard>,
    services: Arc<dyn RoomServices>,
    kpi: Arc<KpiLog>,
    metrics: Arc<Metrics>,
    confidence_min: f64,
    windows: ArrivalWindows,
}

impl CrossingProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room_id: RoomId,
        counter: Arc<OccupancyCounter>,
        board: Arc<WatchBoard>,
        services: Arc<dyn RoomServices>,
        kpi: Arc<KpiLog>,
        metrics: Arc<Metrics>,
        confidence_min: f64,
        windows: ArrivalWindows,
    ) -> Self {
        Self { room_id, counter, board, services, kpi, metrics, confidence_min, windows }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn process(&self, event: &CrossingEvent, ts: Timestamp) -> CrossingOutcome {
        let outcome = self.counter.apply(event, self.confidence_min);
        let (delta, occupancy) = match outcome {
            CrossingOutcome::Filtered => {
                self.metrics.record_filtered();
                debug!(
                    room_id = %self.room_id,
                    kind = %event.kind.as_str(),
                    confidence = %event.confidence,
                    "crossing_filtered"
                );
                self.kpi.write(
                    &self.room_id,
                    ts,
                    &KpiEvent::Filtered {
                        confidence: event.confidence,
                        occupancy: self.counter.occupancy(),
                    },
                );
                return outcome;
            }
            CrossingOutcome::Applied { delta, occupancy } => (delta, occupancy),
        };

        self.metrics.record_crossing(event.kind);
        info!(
            room_id = %self.room_id,
            kind = %event.kind.as_str(),
            confidence = %event.confidence,
            occupancy = %occupancy,
            "crossing_applied"
        );

        let kpi_event = match event.kind {
            CrossingKind::Enter => {
                let checkin = self.attempt_checkin(ts).await;
                KpiEvent::Enter {
                    confidence: event.confidence,
                    delta,
                    occupancy,
                    matched: checkin.reservation_id().is_some(),
                    reservation_id: checkin.reservation_id().cloned(),
                    arrival_window_before_min: self.windows.before.num_minutes(),
                    arrival_window_after_min: self.windows.after.num_minutes(),
                    no_show_grace_min: self.windows.no_show_grace.num_minutes(),
                }
            }
            CrossingKind::Exit => KpiEvent::Exit { confidence: event.confidence, delta, occupancy },
        };
        self.kpi.write(&self.room_id, ts, &kpi_event);
        outcome
    }

    async fn attempt_checkin(&self, ts: Timestamp) -> CheckinResult {
        if self.kpi.is_control_bucket() {
            info!(room_id = %self.room_id, bucket = %self.kpi.bucket(), "ab_control_skip");
            self.record_checkin(false);
            return CheckinResult::NoHit;
        }

        let started = Instant::now();
        let result = self.services.checkin_attempt(&self.room_id, ts).await;
        self.metrics.record_service_latency(started.elapsed().as_millis() as u64);

        let checkin = match result {
            Ok(checkin) => checkin,
            Err(e) => {
                self.metrics.record_service_error();
                warn!(
                    room_id = %self.room_id,
                    ts = %ts.to_rfc3339(),
                    error = %e,
                    "checkin_attempt_failed"
                );
                CheckinResult::NoHit
            }
        };

        match checkin.reservation_id() {
            Some(id) => {
                self.board.record_checkin(id);
                self.record_checkin(true);
                self.spawn_grant_lock();
            }
            None => self.record_checkin(false),
        }
        checkin
    }

    /// Check in a reservation presented at the door, bypassing the sensor
    ///
    /// Matches when the board tracks the reservation for this room and it was
    /// not auto-released. A match grants the lock like a sensor check-in.
    pub fn manual_checkin(&self, id: &ReservationId, ts: Timestamp) -> CheckinResult {
        let matched = self
            .board
            .get(id)
            .is_some_and(|e| e.room_id == self.room_id && !e.auto_released);

        if matched {
            let first = self.board.record_checkin(id);
            info!(
                room_id = %self.room_id,
                reservation_id = %id,
                first = %first,
                ts = %ts.to_rfc3339(),
                "manual_checkin"
            );
        } else {
            warn!(room_id = %self.room_id, reservation_id = %id, "manual_checkin_no_match");
        }
        self.record_checkin(matched);
        self.kpi.write(
            &self.room_id,
            ts,
            &KpiEvent::QrCheckin {
                matched,
                reservation_id: id.clone(),
                method: CHECKIN_METHOD_QR,
            },
        );

        if matched {
            self.spawn_grant_lock();
            CheckinResult::Matched(id.clone())
        } else {
            CheckinResult::NoHit
        }
    }

    fn record_checkin(&self, success: bool) {
        self.counter.record_checkin(success);
        self.metrics.record_checkin(success);
    }

    fn spawn_grant_lock(&self) {
        let services = self.services.clone();
        let metrics = self.metrics.clone();
        let room = self.room_id.clone();
        tokio::spawn(async move {
            match services.grant_lock(&room).await {
                Ok(true) => debug!(room_id = %room, "lock_granted"),
                Ok(false) => warn!(room_id = %room, "lock_grant_rejected"),
                Err(e) => {
                    metrics.record_service_error();
                    warn!(room_id = %room, error = %e, "lock_grant_failed");
                }
            }
        });
    }
}

pub struct SensorPoller {
    source: Arc<dyn DetectionSource>,
    tracker: LineTracker,
    processor: CrossingProcessor,
    clock: Arc<Clock>,
    metrics: Arc<Metrics>,
    period: Duration,
}

impl SensorPoller {
    pub fn new(
        source: Arc<dyn DetectionSource>,
        tracker: LineTracker,
        processor: CrossingProcessor,
        clock: Arc<Clock>,
        metrics: Arc<Metrics>,
        poll_fps: f64,
    ) -> Self {
        let fps = if poll_fps.is_finite() && poll_fps > 0.0 { poll_fps } else { 2.0 };
        let period = Duration::from_secs_f64(1.0 / fps);
        Self { source, tracker, processor, clock, metrics, period }
    }

    /// Fetch and process one frame; returns the number of crossings seen
    ///
    /// A failed fetch is fed as an empty frame so stale tracks are dropped.
    pub async fn poll_once(&mut self) -> usize {
        let boxes = match self.source.fetch_frame().await {
            Ok(boxes) => boxes,
            Err(e) => {
                self.metrics.record_poll_error();
                warn!(
                    room_id = %self.processor.room_id(),
                    ts = %self.clock.now().to_rfc3339(),
                    error = %e,
                    "poller_fetch_failed"
                );
                Vec::new()
            }
        };

        let events = self.tracker.update(&boxes);
        let now = self.clock.now();
        for event in &events {
            self.processor.process(event, now).await;
        }
        events.len()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            room_id = %self.processor.room_id(),
            period_ms = %self.period.as_millis(),
            "sensor_poller_started"
        );
        let mut timer = interval(self.period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(room_id = %self.processor.room_id(), "sensor_poller_shutdown");
                        return;
                    }
                }
                _ = timer.tick() => {}
            }

            let crossings = self.poll_once().await;
            if crossings > 0 {
                debug!(
                    room_id = %self.processor.room_id(),
                    crossings = %crossings,
                    tracks = %self.tracker.active_tracks(),
                    "frame_processed"
                );
            }
        }
    }
}
