//! Detector frame wire format
//!
//! One JSON object per frame, delivered as a JSONL line or an MQTT payload:
//!
//! ```json
//! {"ts": 1767617600000, "detections": [
//!     {"track_id": 4, "class_id": 2, "confidence": 0.91, "bbox": [120.0, 40.0, 220.0, 140.0]}
//! ]}
//! ```

use crate::domain::types::{ClassId, Detection, TrackId};
use serde::Deserialize;

/// A single frame as published by the detector
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionFrame {
    /// Capture time (epoch ms); receipt time is used when absent
    #[serde(default)]
    pub ts: Option<u64>,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

/// A detection before filtering
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDetection {
    /// Null when the detector could not associate the box with a track
    #[serde(default)]
    pub track_id: Option<u64>,
    pub class_id: u32,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default, alias = "center")]
    pub centre: Option<f64>,
    /// [x1, y1, x2, y2]
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
}

impl RawDetection {
    /// Horizontal centroid, falling back to the bbox midpoint
    pub fn centre(&self) -> Option<f64> {
        self.centre.or_else(|| self.bbox.map(|b| (b[0] + b[2]) / 2.0)).filter(|c| c.is_finite())
    }
}

/// Frame after confidence filtering, ready for reconciliation
#[derive(Debug, Clone, Default)]
pub struct FrameBatch {
    pub timestamp: u64,
    pub detections: Vec<Detection>,
    /// Dropped for confidence below threshold
    pub low_confidence: u32,
    /// Dropped for missing track id or position
    pub untracked: u32,
}

impl DetectionFrame {
    /// Parse a frame from a JSON string
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Filter and normalize detections
    ///
    /// Detections without a confidence value are kept regardless of threshold.
    pub fn into_batch(self, min_confidence: f32, received_at: u64) -> FrameBatch {
        let timestamp = self.ts.unwrap_or(received_at);
        let mut batch = FrameBatch { timestamp, ..Default::default() };

        for raw in self.detections {
            if raw.confidence.is_some_and(|c| c < min_confidence) {
                batch.low_confidence += 1;
                continue;
            }
            let (Some(track_id), Some(centre)) = (raw.track_id, raw.centre()) else {
                batch.untracked += 1;
                continue;
            };
            batch.detections.push(Detection {
                track_id: TrackId(track_id),
                class_id: ClassId(raw.class_id),
                centre,
                timestamp,
            });
        }

        batch
    }
}
