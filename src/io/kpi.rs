//! KPI egress - appends room events to a JSONL file
//!
//! Every record carries `ts`, `room_id`, `bucket` and `event`, plus the
//! event-specific fields. Logging is disabled when no path is configured.
//! Write failures are logged and swallowed.
//!
//! The summary readers fold the same file back into per-bucket totals so
//! A/B cohorts can be compared. Unparseable lines are skipped.

use crate::domain::types::{ReservationId, RoomId, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Method tag on manual check-in records
pub const CHECKIN_METHOD_QR: &str = "qr";

const UNKNOWN_BUCKET: &str = "unknown";

#[derive(Debug, Error)]
pub enum KpiError {
    #[error("no KPI log configured or written yet")]
    NoLog,
    #[error("KPI log read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KpiEvent {
    Enter {
        confidence: f64,
        delta: i64,
        occupancy: u32,
        matched: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reservation_id: Option<ReservationId>,
        arrival_window_before_min: i64,
        arrival_window_after_min: i64,
        no_show_grace_min: i64,
    },
    Exit {
        confidence: f64,
        delta: i64,
        occupancy: u32,
    },
    Filtered {
        confidence: f64,
        occupancy: u32,
    },
    NoShowDetected {
        reservation_id: ReservationId,
        arrival_window_after_min: i64,
        no_show_grace_min: i64,
    },
    ReservationClosed {
        reservation_id: ReservationId,
        reason: &'static str,
        end_close_window_min: i64,
    },
    OverstayDetected {
        reservation_id: ReservationId,
        overstay_grace_min: i64,
        occupancy: u32,
    },
    ReservationExtended {
        reservation_id: ReservationId,
        new_end: Timestamp,
        extend_min: i64,
    },
    QrCheckin {
        matched: bool,
        reservation_id: ReservationId,
        method: &'static str,
    },
}

impl KpiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            KpiEvent::Enter { .. } => "enter",
            KpiEvent::Exit { .. } => "exit",
            KpiEvent::Filtered { .. } => "filtered",
            KpiEvent::NoShowDetected { .. } => "no_show_detected",
            KpiEvent::ReservationClosed { .. } => "reservation_closed",
            KpiEvent::OverstayDetected { .. } => "overstay_detected",
            KpiEvent::ReservationExtended { .. } => "reservation_extended",
            KpiEvent::QrCheckin { .. } => "qr_checkin",
        }
    }
}

#[derive(Serialize)]
struct KpiRecord<'a> {
    ts: String,
    room_id: &'a RoomId,
    bucket: &'a str,
    #[serde(flatten)]
    event: &'a KpiEvent,
}

pub struct KpiLog {
    path: Option<PathBuf>,
    bucket: String,
}

impl KpiLog {
    pub fn new(path: Option<&str>, bucket: &str) -> Self {
        let path = path.filter(|p| !p.is_empty()).map(PathBuf::from);
        match &path {
            Some(p) => info!(file_path = %p.display(), bucket = %bucket, "kpi_log_initialized"),
            None => info!(bucket = %bucket, "kpi_log_disabled"),
        }
        Self { path, bucket: bucket.to_string() }
    }

    pub fn disabled(bucket: &str) -> Self {
        Self::new(None, bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// A/B control cohorts skip check-in attempts
    pub fn is_control_bucket(&self) -> bool {
        self.bucket.to_ascii_lowercase().starts_with("control")
    }

    /// Append one record; returns true if a line was written
    pub fn write(&self, room: &RoomId, ts: Timestamp, event: &KpiEvent) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let record =
            KpiRecord { ts: ts.to_rfc3339(), room_id: room, bucket: &self.bucket, event };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!(room_id = %room, event = %event.name(), error = %e, "kpi_encode_failed");
                return false;
            }
        };
        match append_line(path, &line) {
            Ok(()) => {
                debug!(room_id = %room, event = %event.name(), bytes = %line.len(), "kpi_written");
                true
            }
            Err(e) => {
                error!(
                    room_id = %room,
                    event = %event.name(),
                    path = %path.display(),
                    error = %e,
                    "kpi_write_error"
                );
                false
            }
        }
    }
}

/// Sensor enters per bucket and how many matched a reservation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnterSummary {
    pub bucket: String,
    pub enter: u64,
    pub success: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NoShowSummary {
    pub total_no_show: u64,
    pub by_bucket: BTreeMap<String, u64>,
}

/// Manual check-ins per bucket and how many matched
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QrSummary {
    pub bucket: String,
    pub qr_total: u64,
    pub qr_success: u64,
    pub qr_rate: f64,
}

fn rate(hits: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

impl KpiLog {
    /// Enter totals and check-in success rate per bucket, sorted by bucket
    pub fn summary(&self) -> Result<Vec<EnterSummary>, KpiError> {
        let mut per: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        self.scan(|record| {
            if record.event() == Some("enter") {
                let slot = per.entry(record.bucket()).or_default();
                slot.0 += 1;
                if record.matched() {
                    slot.1 += 1;
                }
            }
        })?;
        Ok(per
            .into_iter()
            .map(|(bucket, (enter, success))| EnterSummary {
                bucket,
                enter,
                success,
                rate: rate(success, enter),
            })
            .collect())
    }

    /// No-show totals by bucket; a log that does not exist yet counts as empty
    pub fn no_show_summary(&self) -> Result<NoShowSummary, KpiError> {
        let mut out = NoShowSummary::default();
        let result = self.scan(|record| {
            if record.event() == Some("no_show_detected") {
                out.total_no_show += 1;
                *out.by_bucket.entry(record.bucket()).or_default() += 1;
            }
        });
        match result {
            Ok(()) | Err(KpiError::NoLog) => Ok(out),
            Err(e) => Err(e),
        }
    }

    /// Manual check-in totals and success rate per bucket, sorted by bucket
    pub fn qr_summary(&self) -> Result<Vec<QrSummary>, KpiError> {
        let mut per: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        self.scan(|record| {
            if record.event() == Some("qr_checkin") {
                let slot = per.entry(record.bucket()).or_default();
                slot.0 += 1;
                if record.matched() {
                    slot.1 += 1;
                }
            }
        })?;
        Ok(per
            .into_iter()
            .map(|(bucket, (qr_total, qr_success))| QrSummary {
                bucket,
                qr_total,
                qr_success,
                qr_rate: rate(qr_success, qr_total),
            })
            .collect())
    }

    fn scan(&self, mut visit: impl FnMut(&StoredRecord)) -> Result<(), KpiError> {
        let path = self.path.as_ref().ok_or(KpiError::NoLog)?;
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(KpiError::NoLog),
            Err(e) => return Err(e.into()),
        };
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            match serde_json::from_str::<serde_json::Value>(&line?) {
                Ok(value) => visit(&StoredRecord(value)),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped = %skipped, "kpi_lines_skipped");
        }
        Ok(())
    }
}

/// One parsed line of the log
struct StoredRecord(serde_json::Value);

impl StoredRecord {
    fn event(&self) -> Option<&str> {
        self.0.get("event").and_then(|v| v.as_str())
    }

    fn bucket(&self) -> String {
        self.0.get("bucket").and_then(|v| v.as_str()).unwrap_or(UNKNOWN_BUCKET).to_string()
    }

    fn matched(&self) -> bool {
        self.0.get("matched").and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    file.flush()
}
