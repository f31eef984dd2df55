//! Extension points.
//!
//! Each registry is an ordered list of named callbacks with a fixed
//! composition rule:
//!
//! | registry               | composition                                 |
//! |------------------------|---------------------------------------------|
//! | payload post-processor | pipeline, registration order                |
//! | eligibility check      | AND, runs only after built-in checks pass   |
//! | post-sync observer     | fan-out, every sync outcome                 |
//! | sync failure observer  | fan-out, failed and ineligible syncs        |
//!
//! Field mapping overrides live on
//! [`MappingRegistry`](crate::mapping::MappingRegistry).

use crate::audit::AuditContext;
use crate::record::{Record, RecordId};
use crate::sync::types::SyncOutcome;
use crate::transform::SyncPayload;

pub type PayloadPostProcessor = Box<dyn Fn(SyncPayload, RecordId) -> SyncPayload + Send + Sync>;
pub type EligibilityCheck = Box<dyn Fn(&dyn Record) -> bool + Send + Sync>;
pub type PostSyncObserver = Box<dyn Fn(RecordId, &SyncOutcome) + Send + Sync>;
pub type SyncFailureObserver = Box<dyn Fn(RecordId, &str, &AuditContext) + Send + Sync>;

struct Named<F> {
    name: String,
    callback: F,
}

/// Ordered callback registries.
#[derive(Default)]
pub struct Hooks {
    post_processors: Vec<Named<PayloadPostProcessor>>,
    eligibility_checks: Vec<Named<EligibilityCheck>>,
    post_sync_observers: Vec<Named<PostSyncObserver>>,
    failure_observers: Vec<Named<SyncFailureObserver>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_payload_post_processor<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(SyncPayload, RecordId) -> SyncPayload + Send + Sync + 'static,
    {
        self.post_processors.push(Named {
            name: name.into(),
            callback: Box::new(f),
        });
    }

    pub fn register_eligibility_check<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&dyn Record) -> bool + Send + Sync + 'static,
    {
        self.eligibility_checks.push(Named {
            name: name.into(),
            callback: Box::new(f),
        });
    }

    pub fn register_post_sync_observer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(RecordId, &SyncOutcome) + Send + Sync + 'static,
    {
        self.post_sync_observers.push(Named {
            name: name.into(),
            callback: Box::new(f),
        });
    }

    pub fn register_sync_failure_observer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(RecordId, &str, &AuditContext) + Send + Sync + 'static,
    {
        self.failure_observers.push(Named {
            name: name.into(),
            callback: Box::new(f),
        });
    }

    /// Run every post-processor over the payload, in registration order.
    pub fn apply_post_processors(&self, payload: SyncPayload, record_id: RecordId) -> SyncPayload {
        self.post_processors
            .iter()
            .fold(payload, |payload, p| (p.callback)(payload, record_id))
    }

    /// Name of the first extension check that rejects the record.
    pub fn first_failing_check(&self, record: &dyn Record) -> Option<&str> {
        self.eligibility_checks
            .iter()
            .find(|c| !(c.callback)(record))
            .map(|c| c.name.as_str())
    }

    pub fn notify_synced(&self, record_id: RecordId, outcome: &SyncOutcome) {
        for observer in &self.post_sync_observers {
            tracing::trace!(observer = %observer.name, record_id, "post-sync observer");
            (observer.callback)(record_id, outcome);
        }
    }

    pub fn notify_failure(&self, record_id: RecordId, message: &str, context: &AuditContext) {
        for observer in &self.failure_observers {
            tracing::trace!(observer = %observer.name, record_id, "sync failure observer");
            (observer.callback)(record_id, message, context);
        }
    }

    pub fn post_processor_names(&self) -> Vec<&str> {
        self.post_processors.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn eligibility_check_names(&self) -> Vec<&str> {
        self.eligibility_checks.iter().map(|c| c.name.as_str()).collect()
    }
}
