//! End-to-end: JSONL frame file -> pipeline -> event log and delivery sink

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};
use traffic_analyser::domain::ClassNames;
use traffic_analyser::infra::{Config, Metrics};
use traffic_analyser::io::{
    start_frame_source, CollectorPayload, DeliveryError, EventSink, FrameSource, Geolocator,
};
use traffic_analyser::services::{create_delivery_worker, Pipeline, RetryPolicy};

#[derive(Clone, Default)]
struct RecordingSink {
    delivered: Arc<Mutex<Vec<CollectorPayload>>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, payload: &CollectorPayload) -> Result<(), DeliveryError> {
        self.delivered.lock().push(payload.clone());
        Ok(())
    }
}

fn frames_file() -> String {
    let mut out = String::new();
    // Track 1: a car moving right, visible for five frames
    for (i, centre) in [100.0, 105.0, 110.0, 115.0, 120.0].iter().enumerate() {
        let ts = 1_767_614_400_000u64 + i as u64 * 100;
        let _ = writeln!(
            out,
            r#"{{"ts": {ts}, "detections": [{{"track_id": 1, "class_id": 2, "confidence": 0.9, "centre": {centre}}}]}}"#
        );
    }
    // Eleven empty frames retire it with grace_frames = 10
    for i in 5..16u64 {
        let _ = writeln!(out, r#"{{"ts": {}, "detections": []}}"#, 1_767_614_400_000u64 + i * 100);
    }
    // Track 2 appears, moves left, and is still live when the file ends
    let _ = writeln!(
        out,
        r#"{{"ts": 1767614401600, "detections": [{{"track_id": 2, "class_id": 0, "bbox": [300, 10, 340, 90]}}]}}"#
    );
    let _ = writeln!(out, "garbage line");
    let _ = writeln!(
        out,
        r#"{{"ts": 1767614401700, "detections": [{{"track_id": 2, "class_id": 0, "center": 290.0}}, {{"track_id": 3, "class_id": 0, "confidence": 0.1, "centre": 5.0}}]}}"#
    );
    out
}

#[tokio::test]
async fn test_file_source_end_to_end() {
    let dir = tempdir().unwrap();
    let frames_path = dir.path().join("frames.jsonl");
    let events_path = dir.path().join("out").join("events.jsonl");
    std::fs::write(&frames_path, frames_file()).unwrap();

    let config = Config::from_toml_str(
        &format!(
            "[tracking]\ndirection_threshold = 5.0\ngrace_frames = 10\n[egress]\nfile = \"{}\"\n",
            events_path.to_str().unwrap()
        ),
        "inline".to_string(),
    )
    .unwrap()
    .with_source(frames_path.to_str().unwrap());

    let metrics = Arc::new(Metrics::new());
    let sink = RecordingSink::default();
    let (sender, worker) = create_delivery_worker(
        sink.clone(),
        Arc::new(Geolocator::Disabled),
        ClassNames::coco(),
        RetryPolicy::default(),
        metrics.clone(),
        config.delivery_queue_size(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let source: FrameSource = config.source_uri().parse().unwrap();
    let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_size());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let source_config = config.clone();
    let source_metrics = metrics.clone();
    let source_shutdown = shutdown_rx.clone();
    let source_handle = tokio::spawn(async move {
        start_frame_source(source, &source_config, frame_tx, source_metrics, source_shutdown).await
    });

    let mut pipeline = Pipeline::new(&config, metrics.clone(), Some(sender));
    pipeline.run(frame_rx, shutdown_rx).await;
    drop(pipeline);

    source_handle.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker_handle).await.unwrap().unwrap();

    // Local event log: one retired, one flushed
    let content = std::fs::read_to_string(&events_path).unwrap();
    let events: Vec<serde_json::Value> =
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["id"], 1);
    assert_eq!(events[0]["direction"], "RIGHT");
    assert_eq!(events[0]["timestamp"], 1_767_614_400_000u64);
    assert_eq!(events[0]["frames"], 5);
    assert_eq!(events[1]["id"], 2);
    assert_eq!(events[1]["direction"], "LEFT");

    // Collector payloads carry category names and RFC 3339 timestamps
    let delivered = sink.delivered.lock();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].category, "car");
    assert_eq!(delivered[0].timestamp, "2026-01-05T12:00:00Z");
    assert_eq!(delivered[0].latitude, None);
    assert_eq!(delivered[1].category, "person");
    assert_eq!(delivered[1].direction, "LEFT");

    assert_eq!(metrics.frames_total(), 18);
    assert_eq!(metrics.events_retired(), 1);
    assert_eq!(metrics.events_flushed(), 1);
    assert_eq!(metrics.tracks_created(), 2);
    assert_eq!(metrics.deliveries_ok(), 2);
}

#[tokio::test]
async fn test_shutdown_signal_flushes_pending_tracks() {
    let config = Config::from_toml_str("[egress]\nfile = \"\"\n", "inline".to_string()).unwrap();
    let metrics = Arc::new(Metrics::new());
    let sink = RecordingSink::default();
    let (sender, worker) = create_delivery_worker(
        sink.clone(),
        Arc::new(Geolocator::Disabled),
        ClassNames::coco(),
        RetryPolicy::default(),
        metrics.clone(),
        8,
    );
    let worker_handle = tokio::spawn(worker.run());

    let (frame_tx, frame_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline_handle = tokio::spawn(async move {
        let mut pipeline = Pipeline::new(&config, metrics, Some(sender));
        pipeline.run(frame_rx, shutdown_rx).await;
    });

    let frame = traffic_analyser::domain::DetectionFrame::parse(
        r#"{"ts": 5000, "detections": [{"track_id": 42, "class_id": 7, "centre": 640.0}]}"#,
    )
    .unwrap();
    frame_tx.send(frame).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Source stays open; only the signal ends the run
    shutdown_tx.send(true).unwrap();
    pipeline_handle.await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker_handle).await.unwrap().unwrap();

    let delivered = sink.delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].track_id, 42);
    assert_eq!(delivered[0].category, "truck");
    assert_eq!(delivered[0].direction, "STILL");
    drop(frame_tx);
}
