//! Frame processing loop
//!
//! The Pipeline is the single owner of the Reconciler:
//! - Frames arrive on an mpsc channel from the frame source
//! - Each frame is filtered, reconciled, and its events dispatched
//! - Events go to the local event log and the delivery queue
//! - On shutdown or source exhaustion the live set is flushed

use crate::domain::frame::DetectionFrame;
use crate::domain::types::{epoch_ms, Event};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress::EventLog;
use crate::services::delivery_worker::EventSender;
use crate::services::reconciler::{Reconciler, ReconcilerConfig};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct Pipeline {
    reconciler: Reconciler,
    min_confidence: f32,
    /// Delivery queue (None when delivery is disabled)
    events: Option<EventSender>,
    /// Local JSONL event log (None when disabled)
    event_log: Option<EventLog>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(config: &Config, metrics: Arc<Metrics>, events: Option<EventSender>) -> Self {
        let reconciler = Reconciler::with_metrics(ReconcilerConfig::from(config), metrics.clone());
        Self {
            reconciler,
            min_confidence: config.confidence_threshold(),
            events,
            event_log: config.egress_file().map(EventLog::new),
            metrics,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Process one frame, returning the number of events emitted
    pub fn process_frame(&mut self, frame: DetectionFrame) -> usize {
        let start = Instant::now();
        let batch = frame.into_batch(self.min_confidence, epoch_ms());

        if batch.low_confidence > 0 || batch.untracked > 0 {
            self.metrics
                .record_detections_filtered(batch.low_confidence as u64, batch.untracked as u64);
            debug!(
                low_confidence = %batch.low_confidence,
                untracked = %batch.untracked,
                "detections_filtered"
            );
        }

        let events = self.reconciler.ingest_frame(&batch.detections, batch.timestamp);
        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_frame_processed(batch.detections.len() as u64, latency_us);

        self.dispatch(&events);
        events.len()
    }

    /// Retire every live track, returning the number of events emitted
    pub fn flush(&mut self) -> usize {
        let events = self.reconciler.flush();
        self.dispatch(&events);
        events.len()
    }

    fn dispatch(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }

        if let Some(ref log) = self.event_log {
            log.write_events(events);
        }

        if let Some(ref sender) = self.events {
            for event in events {
                sender.send(event.clone());
            }
        }
    }

    /// Consume frames until the source closes or shutdown is signalled, then flush
    pub async fn run(
        &mut self,
        mut frame_rx: mpsc::Receiver<DetectionFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("pipeline_started");

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            self.process_frame(frame);
                        }
                        None => {
                            info!("frame_source_exhausted");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("pipeline_shutdown");
                        break;
                    }
                }
            }
        }

        let flushed = self.flush();
        info!(
            flushed = %flushed,
            frames = %self.metrics.frames_total(),
            "pipeline_stopped"
        );
    }
}
