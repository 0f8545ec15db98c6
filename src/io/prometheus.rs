//! Prometheus metrics HTTP endpoint
//!
//! Exposes analyser metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, &summary);
    write_track_metrics(&mut output, site_id, &summary);
    write_delivery_metrics(&mut output, site_id, &summary);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "traffic_frames_total",
        "Frames reconciled",
        MetricType::Counter,
        site,
        s.frames_total,
    );
    let _ = writeln!(output, "# HELP traffic_frames_per_sec Frames reconciled per second");
    let _ = writeln!(output, "# TYPE traffic_frames_per_sec gauge");
    let _ = writeln!(output, "traffic_frames_per_sec{{site=\"{site}\"}} {:.2}", s.frames_per_sec);
    write_metric(
        output,
        "traffic_frames_dropped_total",
        "Frames dropped because the pipeline queue was full",
        MetricType::Counter,
        site,
        s.frames_dropped,
    );
    write_metric(
        output,
        "traffic_frames_malformed_total",
        "Frames that failed to parse",
        MetricType::Counter,
        site,
        s.frames_malformed,
    );
    write_metric(
        output,
        "traffic_detections_total",
        "Detections passed to the reconciler",
        MetricType::Counter,
        site,
        s.detections_total,
    );
    write_metric(
        output,
        "traffic_detections_low_confidence_total",
        "Detections dropped below the confidence threshold",
        MetricType::Counter,
        site,
        s.detections_low_confidence,
    );
    write_metric(
        output,
        "traffic_detections_untracked_total",
        "Detections dropped for missing track id or position",
        MetricType::Counter,
        site,
        s.detections_untracked,
    );
    write_histogram(
        output,
        "traffic_ingest_latency_us",
        "Frame ingest latency in microseconds",
        site,
        &s.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        s.avg_ingest_latency_us,
    );
}

fn write_track_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "traffic_live_tracks",
        "Tracks currently live",
        MetricType::Gauge,
        site,
        s.live_tracks,
    );
    write_metric(
        output,
        "traffic_tracks_created_total",
        "Tracks created",
        MetricType::Counter,
        site,
        s.tracks_created,
    );
    write_metric(
        output,
        "traffic_events_retired_total",
        "Events emitted by grace period expiry",
        MetricType::Counter,
        site,
        s.events_retired,
    );
    write_metric(
        output,
        "traffic_events_flushed_total",
        "Events emitted by flush",
        MetricType::Counter,
        site,
        s.events_flushed,
    );
    write_metric(
        output,
        "traffic_anomalies_total",
        "Upstream anomalies (duplicate ids, class changes)",
        MetricType::Counter,
        site,
        s.anomalies_total,
    );
}

fn write_delivery_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    let counters = [
        ("traffic_events_queued_total", "Events queued for delivery", s.events_queued),
        ("traffic_events_dropped_total", "Events dropped on a full delivery queue", s.events_dropped),
        ("traffic_deliveries_ok_total", "Events accepted by the collector", s.deliveries_ok),
        ("traffic_deliveries_failed_total", "Events abandoned after retries", s.deliveries_failed),
        ("traffic_delivery_retries_total", "Delivery retry attempts", s.delivery_retries),
        ("traffic_geolocation_failures_total", "Failed location lookups", s.geolocation_failures),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response =
                text_response(StatusCode::OK, format_prometheus_metrics(&metrics, &site_id));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_frame_processed(3, 150);
        metrics.record_frame_processed(2, 250);
        metrics.record_track_created();
        metrics.record_event_retired();
        metrics.set_live_tracks(4);

        let output = format_prometheus_metrics(&metrics, "junction-7");

        assert!(output.contains("traffic_frames_total{site=\"junction-7\"} 2"));
        assert!(output.contains("traffic_ingest_latency_us_bucket{site=\"junction-7\""));
        assert!(output.contains("traffic_ingest_latency_us_count{site=\"junction-7\"} 2"));
        assert!(output.contains("traffic_live_tracks{site=\"junction-7\"} 4"));
        assert!(output.contains("traffic_events_retired_total{site=\"junction-7\"} 1"));
        assert!(output.contains("# TYPE traffic_deliveries_ok_total counter"));
    }
}
