//! Event egress - appends emitted events to a local file
//!
//! Events are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::domain::types::Event;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for events
pub struct EventLog {
    file_path: String,
}

impl EventLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "event_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write an event to the log file
    /// Returns true if successful, false otherwise
    pub fn write_event(&self, event: &Event) -> bool {
        let json = event.to_json();

        match self.append_line(&json) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    track_id = %event.id,
                    error = %e,
                    "event_log_write_failed"
                );
                false
            }
        }
    }

    /// Append a line to the log file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "event_log_written");

        Ok(())
    }

    /// Write multiple events
    pub fn write_events(&self, events: &[Event]) -> usize {
        events.iter().filter(|event| self.write_event(event)).count()
    }
}
