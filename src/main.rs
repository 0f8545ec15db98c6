//! Traffic analyser - turns per-frame detector output into traffic events
//!
//! Reads tracked detections frame by frame, reconciles them into one event per
//! object with a direction of travel, and delivers events to a collector.
//!
//! Module structure:
//! - `domain/` - Core types (Detection, Event, Direction, frames)
//! - `io/` - External interfaces (frame sources, MQTT, collector, egress)
//! - `services/` - Reconciler, pipeline and delivery worker
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use traffic_analyser::domain::ClassNames;
use traffic_analyser::infra::{Config, Metrics};
use traffic_analyser::io::{start_frame_source, CollectorClient, FrameSource, Geolocator};
use traffic_analyser::services::{create_delivery_worker, Pipeline, RetryPolicy};

/// Traffic analyser - reconciles tracked detections into traffic events
#[derive(Parser, Debug)]
#[command(name = "traffic-analyser", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Frame source override: stdin, -, a JSONL file path, or mqtt://host:port/topic
    #[arg(short, long)]
    source: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging, level via RUST_LOG (default info)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdin/stdout stay free for frame data
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        git_hash = %env!("GIT_HASH"),
        "traffic-analyser starting"
    );

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let mut config = Config::load_from_path(&config_path);
    if let Some(ref source) = args.source {
        config = config.with_source(source);
    }

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        source = %config.source_uri(),
        confidence_threshold = %config.confidence_threshold(),
        direction_threshold = %config.direction_threshold(),
        grace_frames = %config.grace_frames(),
        direction_policy = %config.direction_policy().as_str(),
        delivery_enabled = %config.delivery_enabled(),
        delivery_endpoint = %config.delivery_endpoint(),
        geolocation = %config.geolocation_mode().as_str(),
        egress_file = ?config.egress_file(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let source: FrameSource = config.source_uri().parse()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let metrics = Arc::new(Metrics::new());

    // Delivery worker (if enabled)
    let (event_sender, delivery_handle) = if config.delivery_enabled() {
        let client = CollectorClient::new(&config)?;
        info!(url = %client.url(), "collector_client_ready");

        let class_names = if config.class_names().is_empty() {
            ClassNames::coco()
        } else {
            ClassNames::new(config.class_names().to_vec())
        };

        let (sender, worker) = create_delivery_worker(
            client,
            Arc::new(Geolocator::from_config(&config)),
            class_names,
            RetryPolicy::from_config(&config),
            metrics.clone(),
            config.delivery_queue_size(),
        );
        (Some(sender), Some(tokio::spawn(worker.run())))
    } else {
        (None, None)
    };

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = traffic_analyser::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Frame source (bounded channel for backpressure)
    let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_size());
    let source_config = config.clone();
    let source_metrics = metrics.clone();
    let source_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_frame_source(source, &source_config, frame_tx, source_metrics, source_shutdown)
                .await
        {
            error!(error = %format!("{:#}", e), "frame_source_error");
        }
    });

    // Shutdown on Ctrl+C
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown_signal_received");
            let _ = signal_tx.send(true);
        }
    });

    // Run pipeline until the source is exhausted or shutdown; flushes on exit
    let mut pipeline = Pipeline::new(&config, metrics.clone(), event_sender);
    pipeline.run(frame_rx, shutdown_rx).await;

    // Stop the remaining tasks and close the delivery queue
    let _ = shutdown_tx.send(true);
    drop(pipeline);

    if let Some(handle) = delivery_handle {
        let drain_timeout = Duration::from_millis(config.delivery_drain_timeout_ms());
        match tokio::time::timeout(drain_timeout, handle).await {
            Ok(Ok(())) => info!("delivery_drained"),
            Ok(Err(e)) => error!(error = %e, "delivery_worker_panicked"),
            Err(_) => warn!(
                timeout_ms = %drain_timeout.as_millis(),
                deliveries_ok = %metrics.deliveries_ok(),
                "delivery_drain_timeout"
            ),
        }
    }

    metrics.report().log();
    info!("traffic-analyser shutdown complete");

    // A stdin read parked on the blocking pool would otherwise hold the runtime open
    std::process::exit(0)
}
