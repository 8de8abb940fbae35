//! Line-crossing pseudo-tracker
//!
//! Associates per-frame detection boxes with existing tracks by greedy IoU
//! matching, then reports a crossing whenever a track's center moves from one
//! side of the counting line to the other. Tracks that find no match in a
//! frame are dropped immediately.

use crate::domain::types::{BoundingBox, CrossingEvent, CrossingKind};
use serde::Deserialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSettings {
    pub axis: Axis,
    pub position: f64,
    /// Movement toward increasing coordinates counts as an enter
    pub positive_is_enter: bool,
    pub iou_match: f64,
    pub min_score: f64,
    pub min_size: f64,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            axis: Axis::Y,
            position: 360.0,
            positive_is_enter: true,
            iou_match: 0.3,
            min_score: 0.6,
            min_size: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    bbox: BoundingBox,
    center: (f64, f64),
}

pub type CrossingBatch = SmallVec<[CrossingEvent; 4]>;

pub struct LineTracker {
    settings: LineSettings,
    /// Ordered by id so matching is deterministic
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl LineTracker {
    pub fn new(settings: LineSettings) -> Self {
        Self { settings, tracks: BTreeMap::new(), next_id: 1 }
    }

    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Consume one frame of detections and return the crossings it produced
    pub fn update(&mut self, detections: &[BoundingBox]) -> CrossingBatch {
        let boxes: SmallVec<[BoundingBox; 8]> =
            detections.iter().filter(|b| self.accepts(b)).copied().collect();

        let settings = self.settings;
        let mut assigned = vec![false; boxes.len()];
        let mut events = CrossingBatch::new();
        let mut lost: SmallVec<[u64; 4]> = SmallVec::new();

        for (&id, track) in self.tracks.iter_mut() {
            let mut best: Option<usize> = None;
            let mut best_iou = settings.iou_match;
            for (i, candidate) in boxes.iter().enumerate() {
                if assigned[i] {
                    continue;
                }
                let iou = track.bbox.iou(candidate);
                if iou > best_iou {
                    best = Some(i);
                    best_iou = iou;
                }
            }

            let Some(i) = best else {
                lost.push(id);
                continue;
            };
            assigned[i] = true;

            let matched = boxes[i];
            let center = matched.center();
            if let Some(kind) = crossing(&settings, track.center, center) {
                debug!(track = %id, kind = %kind.as_str(), confidence = %matched.score, "line_crossed");
                events.push(CrossingEvent { kind, confidence: matched.score });
            }
            *track = Track { bbox: matched, center };
        }

        for id in lost {
            self.tracks.remove(&id);
        }

        for (i, b) in boxes.iter().enumerate() {
            if !assigned[i] {
                self.tracks.insert(self.next_id, Track { bbox: *b, center: b.center() });
                self.next_id += 1;
            }
        }

        events
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    fn accepts(&self, b: &BoundingBox) -> bool {
        b.score >= self.settings.min_score
            && b.width() >= self.settings.min_size
            && b.height() >= self.settings.min_size
    }
}

/// Side change of a center across the line, with direction
fn crossing(settings: &LineSettings, prev: (f64, f64), cur: (f64, f64)) -> Option<CrossingKind> {
    let (p, c) = match settings.axis {
        Axis::X => (prev.0, cur.0),
        Axis::Y => (prev.1, cur.1),
    };
    let line = settings.position;
    if (p - line) * (c - line) >= 0.0 {
        return None;
    }
    let sign = if settings.positive_is_enter { 1.0 } else { -1.0 };
    if (c - p) * sign > 0.0 {
        Some(CrossingKind::Enter)
    } else {
        Some(CrossingKind::Exit)
    }
}

impl Default for LineTracker {
    fn default() -> Self {
        Self::new(LineSettings::default())
    }
}
