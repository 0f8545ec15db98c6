//! Detector frame sources
//!
//! A source is selected by URI:
//! - `stdin` or `-` reads JSON lines from standard input
//! - `mqtt://host[:port]/topic` subscribes to a broker
//! - anything else is a path to a JSONL file
//!
//! Line-oriented sources apply backpressure (await on a full channel) and
//! close the channel at end of input. The MQTT source drops on a full channel.

use crate::domain::frame::DetectionFrame;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::mqtt::{start_mqtt_source, MqttEndpoint};
use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSource {
    Stdin,
    File(PathBuf),
    Mqtt(MqttEndpoint),
}

impl FromStr for FrameSource {
    type Err = anyhow::Error;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        match uri.trim() {
            "" => anyhow::bail!("empty frame source"),
            "stdin" | "-" => Ok(FrameSource::Stdin),
            uri if uri.starts_with("mqtt://") => {
                MqttEndpoint::parse(uri).map(FrameSource::Mqtt).with_context(|| {
                    format!("invalid MQTT source '{}', expected mqtt://host[:port]/topic", uri)
                })
            }
            path => Ok(FrameSource::File(PathBuf::from(path))),
        }
    }
}

/// Counts from one run of a line-oriented source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub lines: u64,
    pub frames: u64,
    pub malformed: u64,
}

/// Read JSON lines into the frame channel until EOF, shutdown, or channel close
///
/// Lines that are not UTF-8 or not valid frames are counted and skipped; only
/// I/O errors end the reader.
pub async fn run_reader<R: AsyncBufRead + Unpin>(
    mut reader: R,
    frame_tx: mpsc::Sender<DetectionFrame>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ReaderStats> {
    let mut buf = Vec::new();
    let mut stats = ReaderStats::default();

    loop {
        // Partial reads survive a cancelled select branch in `buf`
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read.context("failed to read frame line")?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("frame_reader_shutdown");
                    break;
                }
                continue;
            }
        };

        if read == 0 && buf.is_empty() {
            break;
        }
        stats.lines += 1;

        let raw = std::mem::take(&mut buf);
        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                stats.malformed += 1;
                metrics.record_frame_malformed();
                warn!(line = %stats.lines, error = %e, "frame_not_utf8");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        let frame = match DetectionFrame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                stats.malformed += 1;
                metrics.record_frame_malformed();
                warn!(line = %stats.lines, error = %e, "frame_malformed");
                continue;
            }
        };

        if frame_tx.send(frame).await.is_err() {
            warn!("frame_channel_closed");
            break;
        }
        stats.frames += 1;
    }

    info!(
        lines = %stats.lines,
        frames = %stats.frames,
        malformed = %stats.malformed,
        "frame_reader_finished"
    );
    Ok(stats)
}

/// Run the configured source until it is exhausted or shutdown is signalled
///
/// Dropping `frame_tx` on return tells the pipeline the source is done.
pub async fn start_frame_source(
    source: FrameSource,
    config: &Config,
    frame_tx: mpsc::Sender<DetectionFrame>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    match source {
        FrameSource::Stdin => {
            info!("frame_source_stdin");
            let reader = BufReader::new(tokio::io::stdin());
            run_reader(reader, frame_tx, metrics, shutdown).await?;
        }
        FrameSource::File(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open frame file {}", path.display()))?;
            info!(path = %path.display(), "frame_source_file");
            run_reader(BufReader::new(file), frame_tx, metrics, shutdown).await?;
        }
        FrameSource::Mqtt(endpoint) => {
            start_mqtt_source(&endpoint, config, frame_tx, metrics, shutdown).await?;
        }
    }
    Ok(())
}
