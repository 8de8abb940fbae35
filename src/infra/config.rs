//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and field is optional; missing values take the defaults
//! below.

use crate::domain::types::RoomId;
use crate::io::room_services::{ApiEndpoint, ServiceSettings};
use crate::services::line_tracker::{Axis, LineSettings};
use crate::services::occupancy_filter::FilterSettings;
use crate::services::penalty::PenaltyPolicy;
use crate::services::room_state::RoomTiming;
use crate::services::watchers::WatcherSettings;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
    /// Rooms this process tracks
    #[serde(default = "default_rooms")]
    pub rooms: Vec<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id(), rooms: default_rooms() }
    }
}

fn default_site_id() -> String {
    "roomwatch".to_string()
}

fn default_rooms() -> Vec<String> {
    vec!["room-a".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// Site zone as minutes east of UTC (JST by default)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    /// Start the clock simulated at this instant
    #[serde(default)]
    pub simulated_start: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            simulated_start: None,
            scale: default_scale(),
        }
    }
}

fn default_utc_offset_minutes() -> i32 {
    540
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservationsConfig {
    #[serde(default = "default_buffer_min")]
    pub buffer_min: i64,
}

impl Default for ReservationsConfig {
    fn default() -> Self {
        Self { buffer_min: default_buffer_min() }
    }
}

fn default_buffer_min() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    #[serde(default = "default_arrival_before_min")]
    pub arrival_window_before_min: i64,
    #[serde(default = "default_arrival_after_min")]
    pub arrival_window_after_min: i64,
    #[serde(default = "default_grace_min")]
    pub grace_period_min: i64,
    #[serde(default = "default_cleanup_min")]
    pub cleanup_margin_min: i64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            arrival_window_before_min: default_arrival_before_min(),
            arrival_window_after_min: default_arrival_after_min(),
            grace_period_min: default_grace_min(),
            cleanup_margin_min: default_cleanup_min(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_arrival_before_min() -> i64 {
    10
}

fn default_arrival_after_min() -> i64 {
    15
}

fn default_grace_min() -> i64 {
    10
}

fn default_cleanup_min() -> i64 {
    30
}

fn default_tick_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OccupancyFilterConfig {
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_majority_threshold")]
    pub majority_threshold: usize,
    #[serde(default = "default_hysteresis_ticks")]
    pub hysteresis_ticks: u32,
}

impl Default for OccupancyFilterConfig {
    fn default() -> Self {
        Self {
            history_len: default_history_len(),
            majority_threshold: default_majority_threshold(),
            hysteresis_ticks: default_hysteresis_ticks(),
        }
    }
}

fn default_history_len() -> usize {
    6
}

fn default_majority_threshold() -> usize {
    3
}

fn default_hysteresis_ticks() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_axis")]
    pub axis: Axis,
    #[serde(default = "default_line_position")]
    pub position: f64,
    #[serde(default = "default_true")]
    pub positive_is_enter: bool,
    #[serde(default = "default_iou_match")]
    pub iou_match: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_min_size")]
    pub min_size: f64,
    /// Crossings below this confidence are counted as filtered only
    #[serde(default = "default_confidence_min")]
    pub confidence_min: f64,
    #[serde(default = "default_poll_fps")]
    pub poll_fps: f64,
    /// Detection endpoint polled by the sensor poller (None disables it)
    #[serde(default)]
    pub detection_url: Option<String>,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            axis: default_axis(),
            position: default_line_position(),
            positive_is_enter: true,
            iou_match: default_iou_match(),
            min_score: default_min_score(),
            min_size: default_min_size(),
            confidence_min: default_confidence_min(),
            poll_fps: default_poll_fps(),
            detection_url: None,
        }
    }
}

fn default_axis() -> Axis {
    Axis::Y
}

fn default_line_position() -> f64 {
    360.0
}

fn default_true() -> bool {
    true
}

fn default_iou_match() -> f64 {
    0.3
}

fn default_min_score() -> f64 {
    0.6
}

fn default_min_size() -> f64 {
    20.0
}

fn default_confidence_min() -> f64 {
    0.9
}

fn default_poll_fps() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,
    #[serde(default = "default_ban_period_days")]
    pub ban_period_days: i64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            ban_threshold: default_ban_threshold(),
            ban_period_days: default_ban_period_days(),
        }
    }
}

fn default_window_days() -> i64 {
    30
}

fn default_ban_threshold() -> u32 {
    3
}

fn default_ban_period_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchersConfig {
    #[serde(default = "default_watch_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_no_show_grace_min")]
    pub no_show_grace_min: i64,
    #[serde(default = "default_end_close_window_min")]
    pub end_close_window_min: i64,
    #[serde(default = "default_overstay_grace_min")]
    pub overstay_grace_min: i64,
}

impl Default for WatchersConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watch_interval_secs(),
            no_show_grace_min: default_no_show_grace_min(),
            end_close_window_min: default_end_close_window_min(),
            overstay_grace_min: default_overstay_grace_min(),
        }
    }
}

fn default_watch_interval_secs() -> u64 {
    30
}

fn default_no_show_grace_min() -> i64 {
    7
}

fn default_end_close_window_min() -> i64 {
    5
}

fn default_overstay_grace_min() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// Reservation API base URL (None degrades to the local mock)
    #[serde(default)]
    pub reservation_api_base: Option<String>,
    #[serde(default)]
    pub reservation_api_key: Option<String>,
    /// Lock API base URL (None degrades to the local mock)
    #[serde(default)]
    pub lock_api_base: Option<String>,
    #[serde(default)]
    pub lock_api_key: Option<String>,
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_checkin_timeout_ms")]
    pub checkin_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub mock_match: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            reservation_api_base: None,
            reservation_api_key: None,
            lock_api_base: None,
            lock_api_key: None,
            timeout_ms: default_service_timeout_ms(),
            checkin_timeout_ms: default_checkin_timeout_ms(),
            mock_match: true,
        }
    }
}

fn default_service_timeout_ms() -> u64 {
    2000
}

fn default_checkin_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct KpiConfig {
    /// JSONL file for KPI events (None or empty disables)
    #[serde(default)]
    pub log_path: Option<String>,
    /// A/B cohort label; labels starting with "control" skip check-ins
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for KpiConfig {
    fn default() -> Self {
        Self { log_path: None, bucket: default_bucket() }
    }
}

fn default_bucket() -> String {
    "treatment".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub reservations: ReservationsConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub occupancy_filter: OccupancyFilterConfig,
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub penalty: PenaltyConfig,
    #[serde(default)]
    pub watchers: WatchersConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub kpi: KpiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    rooms: Vec<RoomId>,
    utc_offset_minutes: i32,
    simulated_start: Option<String>,
    clock_scale: f64,
    buffer_min: i64,
    room: RoomConfig,
    filter: OccupancyFilterConfig,
    line: LineConfig,
    penalty: PenaltyConfig,
    watchers: WatchersConfig,
    services: ServicesConfig,
    kpi_log_path: Option<String>,
    kpi_bucket: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            rooms: toml_config.site.rooms.into_iter().map(RoomId::from).collect(),
            utc_offset_minutes: toml_config.clock.utc_offset_minutes,
            simulated_start: non_empty(toml_config.clock.simulated_start),
            clock_scale: toml_config.clock.scale,
            buffer_min: toml_config.reservations.buffer_min,
            room: toml_config.room,
            filter: toml_config.occupancy_filter,
            line: LineConfig {
                detection_url: non_empty(toml_config.line.detection_url),
                ..toml_config.line
            },
            penalty: toml_config.penalty,
            watchers: toml_config.watchers,
            services: ServicesConfig {
                reservation_api_base: non_empty(toml_config.services.reservation_api_base),
                lock_api_base: non_empty(toml_config.services.lock_api_base),
                ..toml_config.services
            },
            kpi_log_path: non_empty(toml_config.kpi.log_path),
            kpi_bucket: toml_config.kpi.bucket,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: config_file.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn rooms(&self) -> &[RoomId] {
        &self.rooms
    }

    pub fn utc_offset_minutes(&self) -> i32 {
        self.utc_offset_minutes
    }

    pub fn simulated_start(&self) -> Option<&str> {
        self.simulated_start.as_deref()
    }

    pub fn clock_scale(&self) -> f64 {
        self.clock_scale
    }

    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_min)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.room.tick_interval_ms.max(1))
    }

    pub fn confidence_min(&self) -> f64 {
        self.line.confidence_min
    }

    pub fn poll_fps(&self) -> f64 {
        self.line.poll_fps
    }

    pub fn detection_url(&self) -> Option<&str> {
        self.line.detection_url.as_deref()
    }

    pub fn kpi_log_path(&self) -> Option<&str> {
        self.kpi_log_path.as_deref()
    }

    pub fn kpi_bucket(&self) -> &str {
        &self.kpi_bucket
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn room_timing(&self) -> RoomTiming {
        RoomTiming {
            arrival_before: chrono::Duration::minutes(self.room.arrival_window_before_min),
            arrival_after: chrono::Duration::minutes(self.room.arrival_window_after_min),
            grace: chrono::Duration::minutes(self.room.grace_period_min),
            cleanup: chrono::Duration::minutes(self.room.cleanup_margin_min),
        }
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            history_len: self.filter.history_len.max(1),
            majority_threshold: self.filter.majority_threshold,
            hysteresis_ticks: self.filter.hysteresis_ticks,
        }
    }

    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            axis: self.line.axis,
            position: self.line.position,
            positive_is_enter: self.line.positive_is_enter,
            iou_match: self.line.iou_match,
            min_score: self.line.min_score,
            min_size: self.line.min_size,
        }
    }

    pub fn penalty_policy(&self) -> PenaltyPolicy {
        PenaltyPolicy {
            window_days: self.penalty.window_days,
            ban_threshold: self.penalty.ban_threshold,
            ban_period_days: self.penalty.ban_period_days,
        }
    }

    /// Arrival-after is shared with the room state machine
    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            interval: Duration::from_secs(self.watchers.interval_secs.max(1)),
            arrival_after: chrono::Duration::minutes(self.room.arrival_window_after_min),
            no_show_grace: chrono::Duration::minutes(self.watchers.no_show_grace_min),
            end_close_window: chrono::Duration::minutes(self.watchers.end_close_window_min),
            overstay_grace: chrono::Duration::minutes(self.watchers.overstay_grace_min),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        let endpoint = |base: &Option<String>, key: &Option<String>| {
            base.as_ref().map(|b| ApiEndpoint { base: b.clone(), key: key.clone() })
        };
        ServiceSettings {
            reservation_api: endpoint(
                &self.services.reservation_api_base,
                &self.services.reservation_api_key,
            ),
            lock_api: endpoint(&self.services.lock_api_base, &self.services.lock_api_key),
            timeout: Duration::from_millis(self.services.timeout_ms),
            checkin_timeout: Duration::from_millis(self.services.checkin_timeout_ms),
            mock_match: self.services.mock_match,
        }
    }

    /// Builder method for tests to override the room list
    #[cfg(test)]
    pub fn with_rooms(mut self, rooms: &[&str]) -> Self {
        self.rooms = rooms.iter().map(|r| RoomId::from(*r)).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "roomwatch");
        assert_eq!(config.rooms(), &[RoomId::from("room-a")]);
        assert_eq!(config.utc_offset_minutes(), 540);
        assert_eq!(config.buffer(), chrono::Duration::minutes(5));
        assert_eq!(config.room_timing(), RoomTiming::default());
        assert_eq!(config.filter_settings(), FilterSettings::default());
        assert_eq!(config.line_settings(), LineSettings::default());
        assert_eq!(config.penalty_policy(), PenaltyPolicy::default());
        assert_eq!(config.watcher_settings(), WatcherSettings::default());
        assert!((config.confidence_min() - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.kpi_bucket(), "treatment");
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_default_services_are_mocked() {
        let settings = Config::default().service_settings();
        assert!(settings.reservation_api.is_none());
        assert!(settings.lock_api.is_none());
        assert!(settings.mock_match);
        assert_eq!(settings.timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_empty_strings_disable_optional_paths() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[kpi]
log_path = ""

[services]
reservation_api_base = " "

[line]
detection_url = ""
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline");
        assert!(config.kpi_log_path().is_none());
        assert!(config.detection_url().is_none());
        assert!(config.service_settings().reservation_api.is_none());
    }

    #[test]
    fn test_with_rooms() {
        let config = Config::default().with_rooms(&["r1", "r2"]);
        assert_eq!(config.rooms().len(), 2);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["roomwatch".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "roomwatch".to_string(),
            "--config".to_string(),
            "config/site-b.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/site-b.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["roomwatch".to_string(), "--config=config/site-c.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/site-c.toml");
    }
}
