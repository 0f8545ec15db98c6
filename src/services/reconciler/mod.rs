//! Frame-by-frame track reconciliation
//!
//! The Reconciler turns the detector's per-frame detection batches into one
//! `Event` per logical object:
//! - Detections are matched to live tracks by the detector's track id
//! - Unmatched live tracks age through a grace period before retiring
//! - Retiring tracks produce an Event carrying their final direction
//!
//! The live set is owned by a single caller; nothing here blocks or does IO
//! beyond logging.

mod direction;

pub use direction::{classify_step, DirectionState, DirectionTally};

use crate::domain::types::{ClassId, Detection, Direction, Event, TrackId};
use crate::infra::config::{Config, DirectionPolicy};
use crate::infra::metrics::Metrics;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciliation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerConfig {
    /// Minimum centre movement counted as LEFT/RIGHT
    pub direction_threshold: f64,
    /// Missed frames tolerated; the next miss retires the track
    pub grace_frames: u32,
    pub policy: DirectionPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { direction_threshold: 5.0, grace_frames: 10, policy: DirectionPolicy::SingleShot }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            direction_threshold: config.direction_threshold(),
            grace_frames: config.grace_frames(),
            policy: config.direction_policy(),
        }
    }
}

/// A live object as seen by the reconciler
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub id: TrackId,
    /// Fixed at creation
    pub class_id: ClassId,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Last matched centre
    pub centre: f64,
    pub direction: DirectionState,
    /// Consecutive frames since the last match
    pub grace_counter: u32,
    /// Frames matched, including the creating one
    pub frames: u32,
}

impl TrackedObject {
    fn new(detection: &Detection, now: u64, policy: DirectionPolicy) -> Self {
        Self {
            id: detection.track_id,
            class_id: detection.class_id,
            first_seen: now,
            last_seen: now,
            centre: detection.centre,
            direction: DirectionState::new(policy),
            grace_counter: 0,
            frames: 1,
        }
    }

    fn observe(&mut self, centre: f64, now: u64, threshold: f64) {
        self.direction.update(self.centre, centre, threshold);
        self.centre = centre;
        self.last_seen = now;
        self.grace_counter = 0;
        self.frames = self.frames.saturating_add(1);
    }

    /// Current direction under the track's policy
    pub fn current_direction(&self) -> Direction {
        self.direction.resolve()
    }

    fn to_event(&self) -> Event {
        Event {
            id: self.id,
            class_id: self.class_id,
            timestamp: self.first_seen,
            direction: self.direction.resolve(),
            last_seen: self.last_seen,
            frames: self.frames,
        }
    }
}

/// Owns the live set and emits events for retiring tracks
pub struct Reconciler {
    live: FxHashMap<TrackId, TrackedObject>,
    config: ReconcilerConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { live: FxHashMap::default(), config, metrics: None }
    }

    /// Create a reconciler that records counters into `metrics`
    pub fn with_metrics(config: ReconcilerConfig, metrics: Arc<Metrics>) -> Self {
        Self { live: FxHashMap::default(), config, metrics: Some(metrics) }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Number of live (active or pending-retirement) tracks
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackedObject> {
        self.live.get(&id)
    }

    /// Reconcile one frame's detections against the live set
    ///
    /// Returns events for tracks that exceeded the grace period, sorted by id.
    /// An empty batch ages every live track.
    pub fn ingest_frame(&mut self, detections: &[Detection], now: u64) -> Vec<Event> {
        let batch = self.dedup_batch(detections);
        let mut matched: FxHashSet<TrackId> =
            FxHashSet::with_capacity_and_hasher(batch.len(), Default::default());

        for detection in batch {
            self.match_detection(detection, now);
            matched.insert(detection.track_id);
        }

        let retired = self.age_unmatched(&matched);

        if let Some(ref metrics) = self.metrics {
            for _ in &retired {
                metrics.record_event_retired();
            }
            metrics.set_live_tracks(self.live.len());
        }

        retired
    }

    /// Retire every live track, returning their events sorted by id
    pub fn flush(&mut self) -> Vec<Event> {
        let mut events: Vec<Event> = self.live.drain().map(|(_, obj)| obj.to_event()).collect();
        events.sort_by_key(|e| e.id);

        for event in &events {
            info!(
                track_id = %event.id,
                class_id = %event.class_id,
                direction = %event.direction,
                frames = %event.frames,
                "track_flushed"
            );
        }

        if let Some(ref metrics) = self.metrics {
            metrics.record_events_flushed(events.len() as u64);
            metrics.set_live_tracks(0);
        }

        events
    }

    /// Collapse duplicate track ids within one batch, last write wins
    fn dedup_batch<'a>(&self, detections: &'a [Detection]) -> Vec<&'a Detection> {
        let mut index_by_id: FxHashMap<TrackId, usize> =
            FxHashMap::with_capacity_and_hasher(detections.len(), Default::default());
        let mut batch: Vec<&Detection> = Vec::with_capacity(detections.len());

        for detection in detections {
            match index_by_id.get(&detection.track_id) {
                Some(&idx) => {
                    warn!(
                        track_id = %detection.track_id,
                        first_centre = %batch[idx].centre,
                        last_centre = %detection.centre,
                        "duplicate_track_id_in_frame"
                    );
                    self.record_anomaly();
                    batch[idx] = detection;
                }
                None => {
                    index_by_id.insert(detection.track_id, batch.len());
                    batch.push(detection);
                }
            }
        }

        batch
    }

    fn match_detection(&mut self, detection: &Detection, now: u64) {
        let threshold = self.config.direction_threshold;

        if let Some(obj) = self.live.get_mut(&detection.track_id) {
            if obj.class_id != detection.class_id {
                warn!(
                    track_id = %detection.track_id,
                    class_id = %obj.class_id,
                    detected_class_id = %detection.class_id,
                    "class_id_mismatch"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_anomaly();
                }
            }
            let resumed_after = obj.grace_counter;
            obj.observe(detection.centre, now, threshold);
            if resumed_after > 0 {
                debug!(track_id = %obj.id, missed_frames = %resumed_after, "track_resumed");
            }
            return;
        }

        let obj = TrackedObject::new(detection, now, self.config.policy);
        debug!(
            track_id = %obj.id,
            class_id = %obj.class_id,
            centre = %obj.centre,
            "track_created"
        );
        self.live.insert(obj.id, obj);
        if let Some(ref metrics) = self.metrics {
            metrics.record_track_created();
        }
    }

    /// Age tracks not matched this frame, removing those past the grace period
    fn age_unmatched(&mut self, matched: &FxHashSet<TrackId>) -> Vec<Event> {
        let grace_frames = self.config.grace_frames;
        let mut retired = Vec::new();

        self.live.retain(|id, obj| {
            if matched.contains(id) {
                return true;
            }
            if obj.grace_counter < grace_frames {
                obj.grace_counter += 1;
                return true;
            }
            retired.push(obj.to_event());
            false
        });

        retired.sort_by_key(|e| e.id);

        for event in &retired {
            info!(
                track_id = %event.id,
                class_id = %event.class_id,
                direction = %event.direction,
                frames = %event.frames,
                first_seen = %event.timestamp,
                "track_retired"
            );
        }

        retired
    }

    fn record_anomaly(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_anomaly();
        }
    }
}
