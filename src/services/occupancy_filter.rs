//! Debounced occupancy signal from raw per-tick counts
//!
//! Each raw count is binarized and pushed into a fixed-length history. Until
//! the history is full the filter holds its previous output. After that the
//! majority vote must agree for `hysteresis_ticks` consecutive ticks before
//! the visible state flips in either direction.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSettings {
    pub history_len: usize,
    pub majority_threshold: usize,
    pub hysteresis_ticks: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self { history_len: 6, majority_threshold: 3, hysteresis_ticks: 2 }
    }
}

#[derive(Debug, Clone)]
pub struct OccupancyFilter {
    settings: FilterSettings,
    history: VecDeque<bool>,
    occupied: bool,
    consecutive_true: u32,
    consecutive_false: u32,
}

impl OccupancyFilter {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            settings,
            history: VecDeque::with_capacity(settings.history_len),
            occupied: false,
            consecutive_true: 0,
            consecutive_false: 0,
        }
    }

    /// Feed one observation and return the debounced state
    pub fn update(&mut self, raw_count: u32) -> bool {
        if self.history.len() == self.settings.history_len {
            self.history.pop_front();
        }
        self.history.push_back(raw_count > 0);

        if self.history.len() < self.settings.history_len {
            return self.occupied;
        }

        let ones = self.history.iter().filter(|&&v| v).count();
        if ones >= self.settings.majority_threshold {
            self.consecutive_true += 1;
            self.consecutive_false = 0;
        } else {
            self.consecutive_false += 1;
            self.consecutive_true = 0;
        }

        if !self.occupied && self.consecutive_true >= self.settings.hysteresis_ticks {
            self.occupied = true;
        } else if self.occupied && self.consecutive_false >= self.settings.hysteresis_ticks {
            self.occupied = false;
        }

        self.occupied
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied
    }
}

impl Default for OccupancyFilter {
    fn default() -> Self {
        Self::new(FilterSettings::default())
    }
}
