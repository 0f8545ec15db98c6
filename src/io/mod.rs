//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame_source` - Frame source selection (stdin, JSONL file, MQTT)
//! - `mqtt` - MQTT subscriber for detector frames
//! - `collector` - HTTP client for the remote event collector
//! - `geolocation` - Location lookup attached to delivered events
//! - `egress` - Event output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod collector;
pub mod egress;
pub mod frame_source;
pub mod geolocation;
pub mod mqtt;
pub mod prometheus;

// Re-export commonly used types
pub use collector::{CollectorClient, CollectorPayload, DeliveryError, EventSink};
pub use egress::EventLog;
pub use frame_source::{start_frame_source, FrameSource};
pub use geolocation::{Geolocator, Location};
