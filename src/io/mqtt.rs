//! MQTT subscriber for detector frames

use crate::domain::frame::DetectionFrame;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Broker address and topic parsed from `mqtt://host[:port]/topic`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub topic: String,
}

impl MqttEndpoint {
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("mqtt://")?;
        let (authority, topic) = rest.split_once('/')?;
        if topic.is_empty() {
            return None;
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, 1883),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self { host: host.to_string(), port, topic: topic.to_string() })
    }
}

/// Subscribe to the detector topic and forward parsed frames
///
/// Frames are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped frames are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_source(
    endpoint: &MqttEndpoint,
    config: &Config,
    frame_tx: mpsc::Sender<DetectionFrame>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut mqttoptions =
        MqttOptions::new(config.mqtt_client_id(), endpoint.host.as_str(), endpoint.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(endpoint.topic.as_str(), QoS::AtMostOnce).await?;

    info!(
        topic = %endpoint.topic,
        host = %endpoint.host,
        port = %endpoint.port,
        "mqtt_source_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = match std::str::from_utf8(&publish.payload) {
                            Ok(json_str) => DetectionFrame::parse(json_str),
                            Err(e) => {
                                metrics.record_frame_malformed();
                                warn!(error = %e, "mqtt_payload_invalid_utf8");
                                continue;
                            }
                        };

                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(e) => {
                                metrics.record_frame_malformed();
                                debug!(topic = %publish.topic, error = %e, "frame_malformed");
                                continue;
                            }
                        };

                        if let Err(e) = frame_tx.try_send(frame) {
                            match e {
                                TrySendError::Full(_) => {
                                    metrics.record_frame_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!("mqtt_frame_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                TrySendError::Closed(_) => {
                                    warn!("frame_channel_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
