//! Sync pipeline.
//!
//! Host events are debounced in a persisted queue and pushed to the CRM by
//! the [`SyncOrchestrator`]. Per-record state lives in the state store.

pub mod alert;
pub mod engine;
pub mod queue;
pub mod types;

pub use alert::{AlertPayload, Alerter, LogAlerter, RecordingAlerter, WebhookAlerter};
pub use engine::{AuthBlock, SyncOrchestrator};
pub use queue::{Enqueued, PendingSync, SyncQueue};
pub use types::{
    Disposition, FailureKind, SyncEvent, SyncOutcome, SyncPhase, SyncRecord, SyncReport,
    SyncStatus, TriggerReason,
};
