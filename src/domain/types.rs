//! Shared types for the traffic analyser

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Newtype wrapper for detector-assigned track IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for detector class labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClassId(pub u32);

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Horizontal motion classification
///
/// Discriminants double as indices into the vote tally; the declaration order
/// is also the tie-break priority when resolving a majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Still = 0,
    Left = 1,
    Right = 2,
}

impl Direction {
    /// All directions in tie-break priority order
    pub const ALL: [Direction; 3] = [Direction::Still, Direction::Left, Direction::Right];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Still => "STILL",
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detector observation, already filtered and normalized
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub track_id: TrackId,
    pub class_id: ClassId,
    /// Horizontal centroid
    pub centre: f64,
    /// Capture time (epoch ms)
    pub timestamp: u64,
}

impl Detection {
    #[inline]
    pub fn new(track_id: u64, class_id: u32, centre: f64, timestamp: u64) -> Self {
        Self { track_id: TrackId(track_id), class_id: ClassId(class_id), centre, timestamp }
    }
}

/// Finalized report of one object's observed lifetime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: TrackId,
    pub class_id: ClassId,
    /// First-seen time (epoch ms)
    pub timestamp: u64,
    pub direction: Direction,
    /// Time of the last matched frame (epoch ms)
    pub last_seen: u64,
    /// Number of frames the object was matched in
    pub frames: u32,
}

impl Event {
    /// Serialize to a compact JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
