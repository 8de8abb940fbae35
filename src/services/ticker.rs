//! Room ticker - occupancy source to state machine
//!
//! Reads the room's raw count, smooths it through the occupancy filter and
//! advances the room's state machine once per tick.

use crate::domain::clock::Clock;
use crate::domain::error::ReservationError;
use crate::domain::types::RoomId;
use crate::infra::metrics::Metrics;
use crate::io::sensor::OccupancySource;
use crate::services::occupancy_filter::OccupancyFilter;
use crate::services::room_state::{RoomAlert, RoomEvent, RoomRegistry, TickOutcome};
use crate::services::watchers::WatchBoard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub struct RoomTicker {
    room_id: RoomId,
    source: Arc<dyn OccupancySource>,
    filter: OccupancyFilter,
    registry: Arc<RoomRegistry>,
    board: Arc<WatchBoard>,
    clock: Arc<Clock>,
    metrics: Arc<Metrics>,
    period: Duration,
}

impl RoomTicker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room_id: RoomId,
        source: Arc<dyn OccupancySource>,
        filter: OccupancyFilter,
        registry: Arc<RoomRegistry>,
        board: Arc<WatchBoard>,
        clock: Arc<Clock>,
        metrics: Arc<Metrics>,
        period: Duration,
    ) -> Self {
        Self { room_id, source, filter, registry, board, clock, metrics, period }
    }

    /// One tick; an unavailable source counts as nobody present
    pub async fn tick(&mut self) -> Result<TickOutcome, ReservationError> {
        let raw = match self.source.fetch_observation().await {
            Ok(count) => count,
            Err(e) => {
                self.metrics.record_poll_error();
                debug!(room_id = %self.room_id, error = %e, "occupancy_source_unavailable");
                0
            }
        };
        let is_occupied = self.filter.update(raw);
        let now = self.clock.now();

        let outcome = self.registry.tick(&self.room_id, is_occupied, now)?;
        self.metrics.record_tick();

        for event in &outcome.events {
            match event {
                RoomEvent::CheckIn { reservation_id, .. } => {
                    self.board.record_checkin(reservation_id);
                }
                RoomEvent::NoShow { .. } => self.metrics.record_no_show(),
                RoomEvent::SessionFinished { reservation_id } => {
                    info!(room_id = %self.room_id, reservation_id = %reservation_id, "session_finished");
                }
            }
        }

        if outcome.alert == Some(RoomAlert::Overstay) {
            self.metrics.record_overstay_alert();
            warn!(
                room_id = %self.room_id,
                reservation_id = ?outcome.reservation_id,
                ts = %now.to_rfc3339(),
                "overstay_alert"
            );
        }
        Ok(outcome)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            room_id = %self.room_id,
            period_ms = %self.period.as_millis(),
            "room_ticker_started"
        );
        let mut timer = interval(self.period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(room_id = %self.room_id, "room_ticker_shutdown");
                        return;
                    }
                }
                _ = timer.tick() => {}
            }

            if let Err(e) = self.tick().await {
                error!(
                    room_id = %self.room_id,
                    ts = %self.clock.now().to_rfc3339(),
                    error = %e,
                    "room_tick_failed"
                );
            }
        }
    }
}
