//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `sensor` - Detection frame and occupancy count sources
//! - `room_services` - Reservation, check-in and door lock collaborators
//! - `kpi` - Append-only KPI record output (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod kpi;
pub mod prometheus;
pub mod room_services;
pub mod sensor;

// Re-export commonly used types
pub use kpi::{EnterSummary, KpiError, KpiEvent, KpiLog, NoShowSummary, QrSummary};
pub use prometheus::{start_metrics_server, MetricsSources};
pub use room_services::{
    CheckinResult, HttpRoomServices, LocalMatcher, MockRoomServices, RoomServices, ServiceError,
    ServiceSettings,
};
pub use sensor::{
    CounterOccupancySource, DetectionSource, HttpDetectionSource, ManualOccupancySource,
    OccupancySource, SensorError,
};
