//! Services - business logic and state management
//!
//! - `reconciler` - Frame-by-frame track reconciliation and direction classification
//! - `pipeline` - Frame loop owning the reconciler, dispatching events
//! - `delivery_worker` - Async event delivery with retries

pub mod delivery_worker;
pub mod pipeline;
pub mod reconciler;

// Re-export commonly used types
pub use delivery_worker::{
    create_delivery_worker, DeliveryJob, DeliveryWorker, EventSender, RetryPolicy,
};
pub use pipeline::Pipeline;
pub use reconciler::{Reconciler, ReconcilerConfig, TrackedObject};
