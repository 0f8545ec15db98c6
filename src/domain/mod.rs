//! Domain models - core types shared across the pipeline
//!
//! - `Detection` / `Event` / `Direction` - reconciler input and output
//! - `DetectionFrame` - detector wire format and confidence filtering
//! - `ClassNames` - class id to category name table

pub mod classes;
pub mod frame;
pub mod types;

pub use classes::ClassNames;
pub use frame::{DetectionFrame, FrameBatch, RawDetection};
pub use types::{epoch_ms, ClassId, Detection, Direction, Event, TrackId};
