//! Site clock with optional scaled simulation
//!
//! Every component reads "now" through a shared `Clock`. In pass-through mode
//! it returns wall-clock time in the configured zone. In simulated mode it
//! returns `base_sim + (real_now - base_real) * scale`.

use crate::domain::error::ClockError;
use crate::domain::types::Timestamp;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Fastest simulated clock `set_simulated` accepts
pub const MAX_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy)]
struct Simulation {
    base_real: Timestamp,
    base_sim: Timestamp,
    scale: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub use_simulated: bool,
    pub scale: f64,
    pub system_now: Timestamp,
    pub current_now: Timestamp,
    pub base_real: Option<Timestamp>,
    pub base_sim: Option<Timestamp>,
}

pub struct Clock {
    offset: FixedOffset,
    simulation: Mutex<Option<Simulation>>,
}

impl Clock {
    pub fn new(utc_offset_minutes: i32) -> Result<Self, ClockError> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or(ClockError::InvalidOffset(utc_offset_minutes))?;
        Ok(Self::with_offset(offset))
    }

    pub fn with_offset(offset: FixedOffset) -> Self {
        Self { offset, simulation: Mutex::new(None) }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Real time, ignoring any simulation
    pub fn system_now(&self) -> Timestamp {
        Utc::now().with_timezone(&self.offset)
    }

    pub fn now(&self) -> Timestamp {
        let real_now = self.system_now();
        match *self.simulation.lock() {
            Some(sim) => sim.project(real_now),
            None => real_now,
        }
    }

    /// Pin the virtual "now" to `sim_now`, advancing `scale` times faster than real time
    pub fn set_simulated<Tz: TimeZone>(
        &self,
        sim_now: DateTime<Tz>,
        scale: f64,
    ) -> Result<(), ClockError> {
        if scale <= 0.0 || !scale.is_finite() || scale > MAX_SCALE {
            return Err(ClockError::InvalidScale(scale));
        }
        let base_sim = self.normalize(&sim_now);
        let base_real = self.system_now();
        *self.simulation.lock() = Some(Simulation { base_real, base_sim, scale });
        info!(base_sim = %base_sim, scale = %scale, "clock_simulation_set");
        Ok(())
    }

    pub fn clear_simulated(&self) {
        if self.simulation.lock().take().is_some() {
            info!("clock_simulation_cleared");
        }
    }

    pub fn status(&self) -> ClockStatus {
        let system_now = self.system_now();
        let sim = *self.simulation.lock();
        ClockStatus {
            use_simulated: sim.is_some(),
            scale: sim.map_or(1.0, |s| s.scale),
            system_now,
            current_now: sim.map_or(system_now, |s| s.project(system_now)),
            base_real: sim.map(|s| s.base_real),
            base_sim: sim.map(|s| s.base_sim),
        }
    }

    /// Convert any zoned timestamp into the site zone
    pub fn normalize<Tz: TimeZone>(&self, dt: &DateTime<Tz>) -> Timestamp {
        dt.with_timezone(&self.offset)
    }

    /// Interpret a zone-less timestamp as site-local time
    pub fn from_naive(&self, naive: NaiveDateTime) -> Timestamp {
        let utc = naive - chrono::Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, self.offset)
    }

    /// Parse RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` read as site-local time
    pub fn parse(&self, s: &str) -> Result<Timestamp, ClockError> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(self.normalize(&dt));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(|naive| self.from_naive(naive))
            .ok_or_else(|| ClockError::Parse(s.to_string()))
    }
}

impl Simulation {
    fn project(&self, real_now: Timestamp) -> Timestamp {
        let elapsed_us = (real_now - self.base_real).num_microseconds().unwrap_or(i64::MAX);
        let scaled_us = (elapsed_us as f64 * self.scale) as i64;
        // out of DateTime range: hold at the simulated base
        self.base_sim
            .checked_add_signed(chrono::Duration::microseconds(scaled_us))
            .unwrap_or(self.base_sim)
    }
}
