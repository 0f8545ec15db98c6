//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// Monotonic counters are never reset; the latency window is swapped to zero
/// on every `report()`.
pub struct Metrics {
    frames_total: AtomicU64,
    frames_since_report: AtomicU64,
    /// Frames dropped at the source because the pipeline channel was full
    frames_dropped: AtomicU64,
    /// Malformed frames skipped at the source
    frames_malformed: AtomicU64,
    detections_total: AtomicU64,
    detections_low_confidence: AtomicU64,
    detections_untracked: AtomicU64,
    tracks_created: AtomicU64,
    events_retired: AtomicU64,
    events_flushed: AtomicU64,
    /// Upstream anomalies (duplicate ids in a frame, class mismatch)
    anomalies_total: AtomicU64,
    events_queued: AtomicU64,
    events_dropped: AtomicU64,
    deliveries_ok: AtomicU64,
    deliveries_failed: AtomicU64,
    delivery_retries: AtomicU64,
    geolocation_failures: AtomicU64,
    /// Current number of live tracks (gauge)
    live_tracks: AtomicU64,
    /// Frame ingest latency (reset on report)
    ingest_latency_sum_us: AtomicU64,
    ingest_latency_max_us: AtomicU64,
    ingest_latency_buckets: [AtomicU64; NUM_BUCKETS],
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            detections_low_confidence: AtomicU64::new(0),
            detections_untracked: AtomicU64::new(0),
            tracks_created: AtomicU64::new(0),
            events_retired: AtomicU64::new(0),
            events_flushed: AtomicU64::new(0),
            anomalies_total: AtomicU64::new(0),
            events_queued: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            deliveries_ok: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            delivery_retries: AtomicU64::new(0),
            geolocation_failures: AtomicU64::new(0),
            live_tracks: AtomicU64::new(0),
            ingest_latency_sum_us: AtomicU64::new(0),
            ingest_latency_max_us: AtomicU64::new(0),
            ingest_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a reconciled frame with its ingest latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, detections: u64, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.detections_total.fetch_add(detections, Ordering::Relaxed);
        self.ingest_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.ingest_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.ingest_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detections_filtered(&self, low_confidence: u64, untracked: u64) {
        self.detections_low_confidence.fetch_add(low_confidence, Ordering::Relaxed);
        self.detections_untracked.fetch_add(untracked, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_track_created(&self) {
        self.tracks_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_retired(&self) {
        self.events_retired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_events_flushed(&self, count: u64) {
        self.events_flushed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_anomaly(&self) {
        self.anomalies_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_queued(&self) {
        self.events_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_ok(&self) {
        self.deliveries_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_retry(&self) {
        self.delivery_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geolocation_failure(&self) {
        self.geolocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_live_tracks(&self, count: usize) {
        self.live_tracks.store(count as u64, Ordering::Relaxed);
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn tracks_created(&self) -> u64 {
        self.tracks_created.load(Ordering::Relaxed)
    }

    pub fn events_retired(&self) -> u64 {
        self.events_retired.load(Ordering::Relaxed)
    }

    pub fn events_flushed(&self) -> u64 {
        self.events_flushed.load(Ordering::Relaxed)
    }

    pub fn anomalies_total(&self) -> u64 {
        self.anomalies_total.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn deliveries_ok(&self) -> u64 {
        self.deliveries_ok.load(Ordering::Relaxed)
    }

    pub fn deliveries_failed(&self) -> u64 {
        self.deliveries_failed.load(Ordering::Relaxed)
    }

    pub fn delivery_retries(&self) -> u64 {
        self.delivery_retries.load(Ordering::Relaxed)
    }

    pub fn geolocation_failures(&self) -> u64 {
        self.geolocation_failures.load(Ordering::Relaxed)
    }

    pub fn live_tracks(&self) -> u64 {
        self.live_tracks.load(Ordering::Relaxed)
    }

    /// Take a snapshot, resetting the per-window latency counters
    pub fn report(&self) -> MetricsSummary {
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_window = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.ingest_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.ingest_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.ingest_latency_buckets);

        let secs = elapsed.as_secs_f64();
        let frames_per_sec = if secs > 0.0 { frames_window as f64 / secs } else { 0.0 };
        let avg_ingest_latency_us = if frames_window > 0 { latency_sum / frames_window } else { 0 };

        MetricsSummary {
            frames_total: self.frames_total(),
            frames_per_sec,
            frames_dropped: self.frames_dropped(),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_low_confidence: self.detections_low_confidence.load(Ordering::Relaxed),
            detections_untracked: self.detections_untracked.load(Ordering::Relaxed),
            tracks_created: self.tracks_created(),
            events_retired: self.events_retired(),
            events_flushed: self.events_flushed(),
            anomalies_total: self.anomalies_total(),
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_dropped: self.events_dropped(),
            deliveries_ok: self.deliveries_ok(),
            deliveries_failed: self.deliveries_failed(),
            delivery_retries: self.delivery_retries(),
            geolocation_failures: self.geolocation_failures(),
            live_tracks: self.live_tracks(),
            avg_ingest_latency_us,
            max_ingest_latency_us: latency_max,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

/// Point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub frames_dropped: u64,
    pub frames_malformed: u64,
    pub detections_total: u64,
    pub detections_low_confidence: u64,
    pub detections_untracked: u64,
    pub tracks_created: u64,
    pub events_retired: u64,
    pub events_flushed: u64,
    pub anomalies_total: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub delivery_retries: u64,
    pub geolocation_failures: u64,
    pub live_tracks: u64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = %format!("{:.1}", self.frames_per_sec),
            frames_dropped = %self.frames_dropped,
            live_tracks = %self.live_tracks,
            tracks_created = %self.tracks_created,
            events_retired = %self.events_retired,
            events_flushed = %self.events_flushed,
            anomalies = %self.anomalies_total,
            events_dropped = %self.events_dropped,
            deliveries_ok = %self.deliveries_ok,
            deliveries_failed = %self.deliveries_failed,
            avg_ingest_us = %self.avg_ingest_latency_us,
            max_ingest_us = %self.max_ingest_latency_us,
            p99_ingest_us = %self.lat_p99_us,
            "metrics"
        );
    }
}
