//! Integration tests for configuration loading

use roomwatch::domain::RoomId;
use roomwatch::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"
rooms = ["r1", "r2"]

[clock]
utc_offset_minutes = 60
simulated_start = "2026-04-01T09:50:00"
scale = 60.0

[reservations]
buffer_min = 10

[room]
arrival_window_after_min = 20
tick_interval_ms = 250

[line]
axis = "x"
position = 640.0
confidence_min = 0.8
detection_url = "http://sensor.local/frame"

[penalty]
ban_threshold = 2

[watchers]
interval_secs = 5
no_show_grace_min = 3

[services]
reservation_api_base = "http://api.local"
reservation_api_key = "secret"
lock_api_base = ""

[kpi]
log_path = "/tmp/kpi.jsonl"
bucket = "control"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.rooms(), &[RoomId::from("r1"), RoomId::from("r2")]);
    assert_eq!(config.utc_offset_minutes(), 60);
    assert_eq!(config.simulated_start(), Some("2026-04-01T09:50:00"));
    assert_eq!(config.clock_scale(), 60.0);
    assert_eq!(config.buffer(), chrono::Duration::minutes(10));
    assert_eq!(config.tick_interval(), Duration::from_millis(250));
    assert_eq!(config.confidence_min(), 0.8);
    assert_eq!(config.detection_url(), Some("http://sensor.local/frame"));
    assert_eq!(config.kpi_log_path(), Some("/tmp/kpi.jsonl"));
    assert_eq!(config.kpi_bucket(), "control");
    assert_eq!(config.prometheus_port(), 9091);

    // unset fields keep their defaults
    let timing = config.room_timing();
    assert_eq!(timing.arrival_before, chrono::Duration::minutes(10));
    assert_eq!(timing.arrival_after, chrono::Duration::minutes(20));
    assert_eq!(config.penalty_policy().ban_threshold, 2);
    assert_eq!(config.penalty_policy().window_days, 30);

    let watchers = config.watcher_settings();
    assert_eq!(watchers.interval, Duration::from_secs(5));
    assert_eq!(watchers.arrival_after, chrono::Duration::minutes(20));
    assert_eq!(watchers.no_show_grace, chrono::Duration::minutes(3));

    let services = config.service_settings();
    let api = services.reservation_api.unwrap();
    assert_eq!(api.base, "http://api.local");
    assert_eq!(api.key.as_deref(), Some("secret"));
    assert!(services.lock_api.is_none());
    assert_eq!(config.line_settings().position, 640.0);
}

#[test]
fn test_invalid_file_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[site\nid = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
    let config = Config::load_from_path(temp_file.path().to_str().unwrap());
    assert_eq!(config.site_id(), "roomwatch");
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.site_id(), "roomwatch");
    assert_eq!(config.rooms(), &[RoomId::from("room-a")]);
    assert_eq!(config.prometheus_port(), 9090);
    assert_eq!(config.kpi_bucket(), "treatment");
    assert!(config.detection_url().is_none());
}
