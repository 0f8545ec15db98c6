//! Event delivery worker - pushes events to the collector off the hot path
//!
//! The pipeline enqueues retired events into a bounded mpsc channel and never
//! waits on the network. The worker owns retries, geolocation and the HTTP
//! round trip; it runs until every sender is dropped and the queue is empty.

use crate::domain::classes::ClassNames;
use crate::domain::types::{new_uuid_v7, Event};
use crate::infra::config::{Config, GeolocationMode};
use crate::infra::metrics::Metrics;
use crate::io::collector::{CollectorPayload, EventSink};
use crate::io::geolocation::Geolocator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// An event waiting for delivery
#[derive(Debug)]
pub struct DeliveryJob {
    pub event: Event,
    /// Idempotency key, assigned once at enqueue time
    pub eid: String,
    pub enqueued_at: Instant,
}

/// Non-blocking handle used by the pipeline to enqueue events
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<DeliveryJob>,
    metrics: Arc<Metrics>,
}

impl EventSender {
    /// Enqueue an event; a full or closed queue drops it
    pub fn send(&self, event: Event) -> bool {
        let job = DeliveryJob { event, eid: new_uuid_v7(), enqueued_at: Instant::now() };
        match self.tx.try_send(job) {
            Ok(()) => {
                self.metrics.record_event_queued();
                true
            }
            Err(TrySendError::Full(job)) => {
                self.metrics.record_event_dropped();
                warn!(track_id = %job.event.id, eid = %job.eid, "delivery_queue_full");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.metrics.record_event_dropped();
                warn!(track_id = %job.event.id, eid = %job.eid, "delivery_queue_closed");
                false
            }
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.delivery_max_retries(),
            initial_backoff: Duration::from_millis(config.delivery_backoff_ms()),
            max_backoff: Duration::from_millis(config.delivery_max_backoff_ms()),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

/// Format epoch milliseconds as RFC 3339 (UTC)
pub fn format_timestamp(epoch_ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| epoch_ms.to_string())
}

/// Worker that delivers events asynchronously
pub struct DeliveryWorker<S: EventSink> {
    sink: S,
    geolocator: Arc<Geolocator>,
    classes: ClassNames,
    retry: RetryPolicy,
    job_rx: mpsc::Receiver<DeliveryJob>,
    metrics: Arc<Metrics>,
}

impl<S: EventSink> DeliveryWorker<S> {
    pub fn new(
        sink: S,
        geolocator: Arc<Geolocator>,
        classes: ClassNames,
        retry: RetryPolicy,
        job_rx: mpsc::Receiver<DeliveryJob>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { sink, geolocator, classes, retry, job_rx, metrics }
    }

    /// Run the worker, delivering jobs until the channel closes and drains
    pub async fn run(mut self) {
        info!(
            max_retries = %self.retry.max_retries,
            geolocation = %self.geolocator.mode().as_str(),
            "delivery_worker_started"
        );

        while let Some(job) = self.job_rx.recv().await {
            let queue_delay_us = job.enqueued_at.elapsed().as_micros() as u64;
            if queue_delay_us > 1_000_000 {
                warn!(
                    track_id = %job.event.id,
                    queue_delay_us = %queue_delay_us,
                    "delivery_queue_delay_high"
                );
            }
            self.deliver(job).await;
        }

        info!("delivery_worker_stopped");
    }

    async fn payload_for(&self, job: &DeliveryJob) -> CollectorPayload {
        let location = self.geolocator.locate().await;
        if location.is_none() && self.geolocator.mode() != GeolocationMode::Disabled {
            self.metrics.record_geolocation_failure();
        }

        CollectorPayload {
            latitude: location.map(|l| l.latitude),
            longitude: location.map(|l| l.longitude),
            category: self.classes.name(job.event.class_id),
            timestamp: format_timestamp(job.event.timestamp),
            direction: job.event.direction.as_str().to_string(),
            track_id: job.event.id.0,
            eid: job.eid.clone(),
        }
    }

    /// Deliver one job, retrying transient failures; returns true on success
    async fn deliver(&self, job: DeliveryJob) -> bool {
        let payload = self.payload_for(&job).await;
        let mut attempt = 0u32;

        loop {
            let start = Instant::now();
            match self.sink.deliver(&payload).await {
                Ok(()) => {
                    self.metrics.record_delivery_ok();
                    info!(
                        track_id = %payload.track_id,
                        eid = %payload.eid,
                        category = %payload.category,
                        direction = %payload.direction,
                        attempts = %(attempt + 1),
                        latency_us = %start.elapsed().as_micros(),
                        "event_delivered"
                    );
                    return true;
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for(attempt);
                    self.metrics.record_delivery_retry();
                    warn!(
                        track_id = %payload.track_id,
                        eid = %payload.eid,
                        attempt = %(attempt + 1),
                        backoff_ms = %backoff.as_millis(),
                        error = %e,
                        "event_delivery_retry"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_delivery_failed();
                    error!(
                        track_id = %payload.track_id,
                        eid = %payload.eid,
                        attempts = %(attempt + 1),
                        retryable = %e.is_retryable(),
                        error = %e,
                        "event_delivery_failed"
                    );
                    debug!(payload = ?payload, "event_delivery_failed_payload");
                    return false;
                }
            }
        }
    }
}

/// Create a delivery channel and worker
///
/// Returns the sender (for the pipeline) and the worker (to be spawned)
pub fn create_delivery_worker<S: EventSink>(
    sink: S,
    geolocator: Arc<Geolocator>,
    classes: ClassNames,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (EventSender, DeliveryWorker<S>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let worker = DeliveryWorker::new(sink, geolocator, classes, retry, rx, metrics.clone());
    (EventSender { tx, metrics }, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ClassId, Direction, TrackId};
    use crate::io::collector::DeliveryError;
    use crate::io::geolocation::Location;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Records payloads; answers with scripted results, then success
    #[derive(Clone, Default)]
    struct MockSink {
        delivered: Arc<Mutex<Vec<CollectorPayload>>>,
        script: Arc<Mutex<VecDeque<Result<(), u16>>>>,
    }

    impl MockSink {
        fn failing_with(statuses: &[u16]) -> Self {
            let sink = Self::default();
            sink.script.lock().extend(statuses.iter().map(|s| Err(*s)));
            sink
        }

        fn attempts(&self) -> Vec<CollectorPayload> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl EventSink for MockSink {
        async fn deliver(&self, payload: &CollectorPayload) -> Result<(), DeliveryError> {
            self.delivered.lock().push(payload.clone());
            match self.script.lock().pop_front() {
                Some(Err(status)) => Err(DeliveryError::Status { status }),
                _ => Ok(()),
            }
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn event(id: u64, class_id: u32, direction: Direction) -> Event {
        Event {
            id: TrackId(id),
            class_id: ClassId(class_id),
            timestamp: 1_767_614_400_000,
            direction,
            last_seen: 1_767_614_401_000,
            frames: 3,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(3000));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_767_614_400_000), "2026-01-05T12:00:00Z");
        assert_eq!(format_timestamp(1_767_614_400_250), "2026-01-05T12:00:00.25Z");
    }

    #[tokio::test]
    async fn test_delivers_all_queued_events_in_order() {
        let sink = MockSink::default();
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_delivery_worker(
            sink.clone(),
            Arc::new(Geolocator::Disabled),
            ClassNames::coco(),
            fast_retry(0),
            metrics.clone(),
            16,
        );

        assert!(tx.send(event(1, 2, Direction::Left)));
        assert!(tx.send(event(2, 0, Direction::Right)));
        drop(tx);
        worker.run().await;

        let delivered = sink.attempts();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].track_id, 1);
        assert_eq!(delivered[0].category, "car");
        assert_eq!(delivered[0].direction, "LEFT");
        assert_eq!(delivered[0].latitude, None);
        assert_eq!(delivered[1].category, "person");
        assert_ne!(delivered[0].eid, delivered[1].eid);
        assert_eq!(metrics.deliveries_ok(), 2);
    }

    #[tokio::test]
    async fn test_retries_transient_failures_with_same_eid() {
        let sink = MockSink::failing_with(&[503, 429]);
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_delivery_worker(
            sink.clone(),
            Arc::new(Geolocator::Disabled),
            ClassNames::coco(),
            fast_retry(3),
            metrics.clone(),
            4,
        );

        tx.send(event(9, 2, Direction::Still));
        drop(tx);
        worker.run().await;

        let attempts = sink.attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|p| p.eid == attempts[0].eid));
        assert_eq!(metrics.delivery_retries(), 2);
        assert_eq!(metrics.deliveries_ok(), 1);
        assert_eq!(metrics.deliveries_failed(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let sink = MockSink::failing_with(&[500, 500, 500, 500]);
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_delivery_worker(
            sink.clone(),
            Arc::new(Geolocator::Disabled),
            ClassNames::coco(),
            fast_retry(2),
            metrics.clone(),
            4,
        );

        tx.send(event(1, 2, Direction::Left));
        drop(tx);
        worker.run().await;

        assert_eq!(sink.attempts().len(), 3);
        assert_eq!(metrics.deliveries_failed(), 1);
        assert_eq!(metrics.deliveries_ok(), 0);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let sink = MockSink::failing_with(&[400]);
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_delivery_worker(
            sink.clone(),
            Arc::new(Geolocator::Disabled),
            ClassNames::coco(),
            fast_retry(5),
            metrics.clone(),
            4,
        );

        tx.send(event(1, 2, Direction::Left));
        drop(tx);
        worker.run().await;

        assert_eq!(sink.attempts().len(), 1);
        assert_eq!(metrics.delivery_retries(), 0);
        assert_eq!(metrics.deliveries_failed(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_event() {
        let sink = MockSink::default();
        let metrics = Arc::new(Metrics::new());
        let (tx, _worker) = create_delivery_worker(
            sink,
            Arc::new(Geolocator::Disabled),
            ClassNames::coco(),
            fast_retry(0),
            metrics.clone(),
            1,
        );

        assert!(tx.send(event(1, 2, Direction::Left)));
        assert!(!tx.send(event(2, 2, Direction::Left)));
        assert_eq!(metrics.events_dropped(), 1);
    }

    #[tokio::test]
    async fn test_fixed_location_attached() {
        let sink = MockSink::default();
        let (tx, worker) = create_delivery_worker(
            sink.clone(),
            Arc::new(Geolocator::Fixed(Location { latitude: 53.34, longitude: -6.27 })),
            ClassNames::new(vec!["bike".to_string()]),
            fast_retry(0),
            Arc::new(Metrics::new()),
            4,
        );

        tx.send(event(4, 0, Direction::Right));
        tx.send(event(5, 17, Direction::Right));
        drop(tx);
        worker.run().await;

        let delivered = sink.attempts();
        assert_eq!(delivered[0].latitude, Some(53.34));
        assert_eq!(delivered[0].longitude, Some(-6.27));
        assert_eq!(delivered[0].category, "bike");
        assert_eq!(delivered[1].category, "class_17");
        assert_eq!(delivered[0].timestamp, "2026-01-05T12:00:00Z");
    }
}
