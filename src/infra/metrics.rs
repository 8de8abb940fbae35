//! Lock-free metrics collection and periodic reporting
//!
//! Counter updates are plain atomic adds. Reporting swaps the periodic
//! counters to zero; monotonic totals are only ever read.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical
//! counters only and must not drive room state decisions.

use crate::domain::types::CrossingKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Collaborator call latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2000, ≤3000, >3000
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2000, 3000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // last bucket reports 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2000, 3000, 6000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

pub struct Metrics {
    /// FSM ticks across all rooms (monotonic)
    ticks_total: AtomicU64,
    /// Ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    crossings_enter: AtomicU64,
    crossings_exit: AtomicU64,
    crossings_filtered: AtomicU64,
    checkin_success: AtomicU64,
    checkin_fail: AtomicU64,
    /// Reservations the FSM marked NO_SHOW
    no_shows: AtomicU64,
    /// Reservations the no-show watcher released
    auto_releases: AtomicU64,
    sessions_closed: AtomicU64,
    /// Per-tick FSM overstay alerts
    overstay_alerts: AtomicU64,
    /// One-shot overstay flags raised by the end watcher
    overstays_detected: AtomicU64,
    penalties: AtomicU64,
    poll_errors: AtomicU64,
    watcher_errors: AtomicU64,
    service_errors: AtomicU64,
    /// Collaborator call latency histogram (reset on report)
    service_latency_buckets: [AtomicU64; NUM_BUCKETS],
    service_latency_sum_ms: AtomicU64,
    service_latency_max_ms: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            crossings_enter: AtomicU64::new(0),
            crossings_exit: AtomicU64::new(0),
            crossings_filtered: AtomicU64::new(0),
            checkin_success: AtomicU64::new(0),
            checkin_fail: AtomicU64::new(0),
            no_shows: AtomicU64::new(0),
            auto_releases: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            overstay_alerts: AtomicU64::new(0),
            overstays_detected: AtomicU64::new(0),
            penalties: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            watcher_errors: AtomicU64::new(0),
            service_errors: AtomicU64::new(0),
            service_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            service_latency_sum_ms: AtomicU64::new(0),
            service_latency_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_crossing(&self, kind: CrossingKind) {
        match kind {
            CrossingKind::Enter => self.crossings_enter.fetch_add(1, Ordering::Relaxed),
            CrossingKind::Exit => self.crossings_exit.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_filtered(&self) {
        self.crossings_filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checkin(&self, success: bool) {
        if success {
            self.checkin_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkin_fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A no-show always carries a penalty
    #[inline]
    pub fn record_no_show(&self) {
        self.no_shows.fetch_add(1, Ordering::Relaxed);
        self.penalties.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auto_release(&self) {
        self.auto_releases.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overstay_alert(&self) {
        self.overstay_alerts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overstay_detected(&self) {
        self.overstays_detected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_watcher_error(&self) {
        self.watcher_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_service_error(&self) {
        self.service_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one outbound collaborator call latency
    #[inline]
    pub fn record_service_latency(&self, latency_ms: u64) {
        self.service_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.service_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.service_latency_max_ms, latency_ms);
    }

    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    pub fn crossings_enter(&self) -> u64 {
        self.crossings_enter.load(Ordering::Relaxed)
    }

    pub fn crossings_exit(&self) -> u64 {
        self.crossings_exit.load(Ordering::Relaxed)
    }

    pub fn crossings_filtered(&self) -> u64 {
        self.crossings_filtered.load(Ordering::Relaxed)
    }

    pub fn checkin_success(&self) -> u64 {
        self.checkin_success.load(Ordering::Relaxed)
    }

    pub fn checkin_fail(&self) -> u64 {
        self.checkin_fail.load(Ordering::Relaxed)
    }

    pub fn no_shows(&self) -> u64 {
        self.no_shows.load(Ordering::Relaxed)
    }

    pub fn auto_releases(&self) -> u64 {
        self.auto_releases.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    pub fn overstay_alerts(&self) -> u64 {
        self.overstay_alerts.load(Ordering::Relaxed)
    }

    pub fn overstays_detected(&self) -> u64 {
        self.overstays_detected.load(Ordering::Relaxed)
    }

    pub fn penalties(&self) -> u64 {
        self.penalties.load(Ordering::Relaxed)
    }

    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::Relaxed)
    }

    pub fn watcher_errors(&self) -> u64 {
        self.watcher_errors.load(Ordering::Relaxed)
    }

    pub fn service_errors(&self) -> u64 {
        self.service_errors.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self, tracked_rooms: usize, total_occupancy: u64) -> MetricsSummary {
        let ticks_count = self.ticks_since_report.swap(0, Ordering::Relaxed);
        let service_buckets = swap_buckets(&self.service_latency_buckets);
        let service_sum = self.service_latency_sum_ms.swap(0, Ordering::Relaxed);
        let service_max = self.service_latency_max_ms.swap(0, Ordering::Relaxed);
        let service_calls: u64 = service_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let ticks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            ticks_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            ticks_total: self.ticks_total(),
            ticks_per_sec,
            tracked_rooms,
            total_occupancy,
            crossings_enter: self.crossings_enter(),
            crossings_exit: self.crossings_exit(),
            crossings_filtered: self.crossings_filtered(),
            checkin_success: self.checkin_success(),
            checkin_fail: self.checkin_fail(),
            no_shows: self.no_shows(),
            auto_releases: self.auto_releases(),
            sessions_closed: self.sessions_closed(),
            overstay_alerts: self.overstay_alerts(),
            overstays_detected: self.overstays_detected(),
            penalties: self.penalties(),
            poll_errors: self.poll_errors(),
            watcher_errors: self.watcher_errors(),
            service_errors: self.service_errors(),
            service_calls,
            service_latency_buckets: service_buckets,
            service_latency_avg_ms: if service_calls > 0 { service_sum / service_calls } else { 0 },
            service_latency_max_ms: service_max,
            service_latency_p99_ms: percentile_from_buckets(&service_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    pub tracked_rooms: usize,
    pub total_occupancy: u64,
    pub crossings_enter: u64,
    pub crossings_exit: u64,
    pub crossings_filtered: u64,
    pub checkin_success: u64,
    pub checkin_fail: u64,
    pub no_shows: u64,
    pub auto_releases: u64,
    pub sessions_closed: u64,
    pub overstay_alerts: u64,
    pub overstays_detected: u64,
    pub penalties: u64,
    pub poll_errors: u64,
    pub watcher_errors: u64,
    pub service_errors: u64,
    /// Collaborator calls since last report
    pub service_calls: u64,
    /// Bounds: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2000, ≤3000, >3000 ms
    pub service_latency_buckets: [u64; NUM_BUCKETS],
    pub service_latency_avg_ms: u64,
    pub service_latency_max_ms: u64,
    pub service_latency_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            rooms = %self.tracked_rooms,
            occupancy = %self.total_occupancy,
            enter = %self.crossings_enter,
            exit = %self.crossings_exit,
            filtered = %self.crossings_filtered,
            checkin_ok = %self.checkin_success,
            checkin_fail = %self.checkin_fail,
            no_shows = %self.no_shows,
            auto_releases = %self.auto_releases,
            closed = %self.sessions_closed,
            overstays = %self.overstays_detected,
            penalties = %self.penalties,
            errors = %(self.poll_errors + self.watcher_errors + self.service_errors),
            svc_p99_ms = %self.service_latency_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.ticks_total(), 0);
        assert_eq!(metrics.penalties(), 0);
    }

    #[test]
    fn test_record_crossings_and_checkins() {
        let metrics = Metrics::new();
        metrics.record_crossing(CrossingKind::Enter);
        metrics.record_crossing(CrossingKind::Enter);
        metrics.record_crossing(CrossingKind::Exit);
        metrics.record_filtered();
        metrics.record_checkin(true);
        metrics.record_checkin(false);

        assert_eq!(metrics.crossings_enter(), 2);
        assert_eq!(metrics.crossings_exit(), 1);
        assert_eq!(metrics.crossings_filtered(), 1);
        assert_eq!((metrics.checkin_success(), metrics.checkin_fail()), (1, 1));
    }

    #[test]
    fn test_no_show_counts_penalty() {
        let metrics = Metrics::new();
        metrics.record_no_show();
        assert_eq!(metrics.no_shows(), 1);
        assert_eq!(metrics.penalties(), 1);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();
        metrics.record_tick();
        metrics.record_tick();
        metrics.record_service_latency(20);
        metrics.record_service_latency(40);
        metrics.record_session_closed();

        let summary = metrics.report(3, 2);
        assert_eq!(summary.ticks_total, 2);
        assert_eq!(summary.tracked_rooms, 3);
        assert_eq!(summary.total_occupancy, 2);
        assert_eq!(summary.service_calls, 2);
        assert_eq!(summary.service_latency_avg_ms, 30);
        assert_eq!(summary.service_latency_max_ms, 40);
        assert_eq!(summary.sessions_closed, 1);

        // periodic counters reset, totals kept
        let summary = metrics.report(3, 2);
        assert_eq!(summary.ticks_total, 2);
        assert_eq!(summary.service_calls, 0);
        assert_eq!(summary.service_latency_max_ms, 0);
        assert_eq!(metrics.ticks_since_report.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_tick();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.ticks_total(), 4000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(5), 0);
        assert_eq!(bucket_index(6), 1);
        assert_eq!(bucket_index(3000), 9);
        assert_eq!(bucket_index(3001), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let mut buckets = [0u64; NUM_BUCKETS];
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 0);

        buckets[0] = 90;
        buckets[4] = 10;
        assert_eq!(percentile_from_buckets(&buckets, 0.50), 5);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 100);
    }
}
