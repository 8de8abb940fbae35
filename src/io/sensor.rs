//! Sensor inputs - detection frames and occupancy observations
//!
//! Vendor payloads come in several JSON shapes. `normalize_detections` is the
//! only place that knows about them; everything downstream sees
//! `BoundingBox` values.

use crate::domain::types::BoundingBox;
use crate::services::occupancy::OccupancyCounter;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sensor payload could not be decoded: {0}")]
    Decode(String),
    #[error("sensor unavailable")]
    Unavailable,
}

/// Produces one frame of detection boxes per call
#[async_trait]
pub trait DetectionSource: Send + Sync {
    async fn fetch_frame(&self) -> Result<Vec<BoundingBox>, SensorError>;
}

/// Produces a raw per-tick person count
#[async_trait]
pub trait OccupancySource: Send + Sync {
    async fn fetch_observation(&self) -> Result<u32, SensorError>;
}

/// Polls a JSON endpoint that returns detection boxes
pub struct HttpDetectionSource {
    client: reqwest::Client,
    url: String,
}

impl HttpDetectionSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SensorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl DetectionSource for HttpDetectionSource {
    async fn fetch_frame(&self) -> Result<Vec<BoundingBox>, SensorError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            debug!(url = %self.url, status = %resp.status(), "detection_source_status");
            return Err(SensorError::Unavailable);
        }
        let payload: Value =
            resp.json().await.map_err(|e| SensorError::Decode(e.to_string()))?;
        Ok(normalize_detections(&payload))
    }
}

/// Reads the live crossing counter of a room
pub struct CounterOccupancySource {
    counter: Arc<OccupancyCounter>,
}

impl CounterOccupancySource {
    pub fn new(counter: Arc<OccupancyCounter>) -> Self {
        Self { counter }
    }
}

#[async_trait]
impl OccupancySource for CounterOccupancySource {
    async fn fetch_observation(&self) -> Result<u32, SensorError> {
        Ok(self.counter.occupancy())
    }
}

/// Operator-controlled count for bench setups without a camera
#[derive(Default)]
pub struct ManualOccupancySource {
    count: AtomicU32,
}

impl ManualOccupancySource {
    pub fn new(initial: u32) -> Self {
        Self { count: AtomicU32::new(initial) }
    }

    pub fn set(&self, count: u32) {
        self.count.store(count, Ordering::Relaxed);
    }
}

#[async_trait]
impl OccupancySource for ManualOccupancySource {
    async fn fetch_observation(&self) -> Result<u32, SensorError> {
        Ok(self.count.load(Ordering::Relaxed))
    }
}

fn num(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

fn has_all(obj: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().all(|k| num(obj, k).is_some())
}

/// Normalized coordinates only scale when a real frame size is given
fn looks_normalized(a: f64, b: f64, w: f64, h: f64, frame_w: f64, frame_h: f64) -> bool {
    (0.0..=1.0).contains(&a)
        && (0.0..=1.0).contains(&b)
        && w > 0.0
        && w <= 1.0
        && h > 0.0
        && h <= 1.0
        && (frame_w > 1.0 || frame_h > 1.0)
}

/// Convert any supported detection payload into canonical boxes
///
/// Supported shapes:
/// - keyed objects `{"1": {"X": l, "Y": t, "x": r, "y": b, "P": score}, ...}`
/// - `{"boxes": [...], "frame_w": .., "frame_h": ..}` where each box is
///   `cx,cy,w,h`, `x,y,width,height` or `left,top,right,bottom`
///
/// Scores come from `score` or `P` and default to 1.0. Unrecognized entries
/// are skipped.
pub fn normalize_detections(payload: &Value) -> Vec<BoundingBox> {
    let Some(obj) = payload.as_object() else {
        return Vec::new();
    };

    let keyed = obj.values().any(|v| v.as_object().is_some_and(|b| b.contains_key("X")));
    if keyed {
        let mut entries: Vec<(&String, &Map<String, Value>)> =
            obj.iter().filter_map(|(k, v)| v.as_object().map(|b| (k, b))).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        return entries
            .into_iter()
            .filter(|(_, b)| has_all(b, &["X", "Y", "x", "y", "P"]))
            .filter_map(|(_, b)| {
                Some(BoundingBox::new(num(b, "X")?, num(b, "Y")?, num(b, "x")?, num(b, "y")?, num(b, "P")?))
            })
            .collect();
    }

    let Some(boxes) = obj.get("boxes").and_then(Value::as_array) else {
        return Vec::new();
    };
    let frame_w = num(obj, "frame_w").unwrap_or(1.0);
    let frame_h = num(obj, "frame_h").unwrap_or(1.0);

    boxes
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|b| {
            let score = num(b, "score").or_else(|| num(b, "P")).unwrap_or(1.0);

            if has_all(b, &["cx", "cy", "w", "h"]) {
                let (mut cx, mut cy, mut w, mut h) =
                    (num(b, "cx")?, num(b, "cy")?, num(b, "w")?, num(b, "h")?);
                if looks_normalized(cx, cy, w, h, frame_w, frame_h) {
                    cx *= frame_w;
                    cy *= frame_h;
                    w *= frame_w;
                    h *= frame_h;
                }
                return Some(BoundingBox::new(
                    cx - w / 2.0,
                    cy - h / 2.0,
                    cx + w / 2.0,
                    cy + h / 2.0,
                    score,
                ));
            }

            if has_all(b, &["x", "y", "width", "height"]) {
                let (mut l, mut t, mut w, mut h) =
                    (num(b, "x")?, num(b, "y")?, num(b, "width")?, num(b, "height")?);
                if looks_normalized(l, t, w, h, frame_w, frame_h) {
                    l *= frame_w;
                    t *= frame_h;
                    w *= frame_w;
                    h *= frame_h;
                }
                return Some(BoundingBox::new(l, t, l + w, t + h, score));
            }

            if has_all(b, &["left", "top", "right", "bottom"]) {
                return Some(BoundingBox::new(
                    num(b, "left")?,
                    num(b, "top")?,
                    num(b, "right")?,
                    num(b, "bottom")?,
                    score,
                ));
            }

            None
        })
        .collect()
}
