//! Sync orchestrator.
//!
//! Drives one record through the pipeline:
//!
//! ```text
//! Triggered → Validating ─┬→ Ineligible
//!                         └→ Transforming → Calling ─┬→ Success
//!                                                    ├→ Retryable (re-queued)
//!                                                    └→ Failed
//! ```
//!
//! Host events are debounced through the [`SyncQueue`]; manual syncs run
//! immediately. An authentication failure latches an auth block in the state
//! store, after which syncs fail fast without touching the remote API until a
//! connection test succeeds or the block is cleared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{AuditCategory, AuditContext, AuditEntry, AuditLevel, AuditTrail};
use crate::error::{ApiErrorKind, AuthError, ConfigError, DatabaseError, Result, SourceError};
use crate::hooks::Hooks;
use crate::mapping::MappingRegistry;
use crate::record::{Record, RecordId, RecordSource};
use crate::remote::{ConnectionReport, CrmApi};
use crate::storage::{load_json, save_json, Config, RecordTypeConfig, StateStore, SyncSettings};
use crate::sync::alert::{Alerter, LogAlerter};
use crate::sync::queue::{Enqueued, PendingSync, SyncQueue};
use crate::sync::types::{
    Disposition, FailureKind, SyncEvent, SyncOutcome, SyncPhase, SyncRecord, SyncReport,
    SyncStatus, TriggerReason,
};
use crate::transform::{build_payload, PayloadMetadata};
use crate::validator::{Eligibility, Validator};

const AUTH_BLOCK_KEY: &str = "auth_block";

/// Latched after the CRM rejects our credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthBlock {
    pub since: DateTime<Utc>,
    pub reason: String,
}

fn trigger_context(record: &dyn Record, trigger: &PendingSync) -> AuditContext {
    let mut context = AuditContext::new();
    context.insert("record_type".into(), Value::from(record.record_type()));
    context.insert("trigger".into(), Value::from(trigger.reason_label()));
    if !trigger.changed_fields.is_empty() {
        context.insert(
            "changed_fields".into(),
            Value::from(trigger.changed_fields.iter().cloned().collect::<Vec<_>>()),
        );
    }
    context.insert("attempt".into(), Value::from(trigger.attempts + 1));
    context
}

/// Per-record sync state machine plus the pending-sync queue.
pub struct SyncOrchestrator<A> {
    api: A,
    store: Arc<dyn StateStore>,
    registry: MappingRegistry,
    validator: Validator,
    hooks: Hooks,
    queue: SyncQueue,
    audit: AuditTrail,
    alerter: Box<dyn Alerter>,
    settings: SyncSettings,
    record_types: BTreeMap<String, RecordTypeConfig>,
}

impl<A: CrmApi> SyncOrchestrator<A> {
    pub fn new(config: &Config, store: Arc<dyn StateStore>, api: A, queue: SyncQueue) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            api,
            registry: MappingRegistry::new(store.clone()),
            validator: Validator::new(config.record_types.clone(), audit.clone()),
            hooks: Hooks::new(),
            queue,
            audit,
            alerter: Box::new(LogAlerter),
            settings: config.sync.clone(),
            record_types: config.record_types.clone(),
            store,
        }
    }

    pub fn with_alerter(mut self, alerter: impl Alerter + 'static) -> Self {
        self.alerter = Box::new(alerter);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut MappingRegistry {
        &mut self.registry
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn syncs_record_type(&self, record_type: &str) -> bool {
        self.record_types.contains_key(record_type)
    }

    pub fn sync_state(&self, record_id: RecordId) -> Result<Option<SyncRecord>, DatabaseError> {
        self.store.sync_record(record_id)
    }

    pub fn auth_block(&self) -> Result<Option<AuthBlock>, DatabaseError> {
        load_json(self.store.as_ref(), AUTH_BLOCK_KEY)
    }

    /// Lift the auth block. Returns whether one was set.
    pub fn clear_auth_block(&self) -> Result<bool, DatabaseError> {
        if self.auth_block()?.is_none() {
            return Ok(false);
        }
        self.store.kv_delete(AUTH_BLOCK_KEY)?;
        self.audit.info(
            AuditCategory::Authentication,
            None,
            "Authentication block cleared; syncing resumed",
        );
        Ok(true)
    }

    /// Check credentials against the CRM. Success lifts the auth block.
    pub async fn test_connection(&self) -> Result<ConnectionReport> {
        let report = self.api.test_connection().await;
        if report.ok {
            self.audit.info(AuditCategory::Authentication, None, "Connection test passed");
            self.clear_auth_block()?;
        } else {
            let kind = report.kind.map_or("unknown", |k| k.as_str());
            self.audit.record(
                AuditEntry::new(
                    AuditLevel::Error,
                    AuditCategory::Authentication,
                    format!("Connection test failed: {}", report.message),
                )
                .with("kind", kind),
            );
        }
        Ok(report)
    }

    /// Local keys whose change should trigger a sync.
    fn tracked_fields(&self, record_type: &str, config: &RecordTypeConfig) -> Result<BTreeSet<String>> {
        if !config.tracked_fields.is_empty() {
            return Ok(config.tracked_fields.iter().cloned().collect());
        }
        Ok(self.registry.snapshot(record_type)?.source_keys())
    }

    /// React to a host event.
    pub async fn handle_event(
        &mut self,
        event: &SyncEvent,
        source: &dyn RecordSource,
    ) -> Result<Disposition> {
        self.handle_event_at(event, source, Utc::now()).await
    }

    pub async fn handle_event_at(
        &mut self,
        event: &SyncEvent,
        source: &dyn RecordSource,
        now: DateTime<Utc>,
    ) -> Result<Disposition> {
        tracing::debug!(
            record_id = event.record_id,
            reason = event.reason.as_str(),
            phase = SyncPhase::Triggered.as_str(),
            "sync event"
        );

        let Some(config) = self.record_types.get(&event.record_type).cloned() else {
            return Ok(Disposition::Ignored {
                reason: format!("record type '{}' is not synced", event.record_type),
            });
        };

        if event.reason == TriggerReason::Manual {
            return Ok(Disposition::Completed(
                self.sync_now(event.record_id, source).await?,
            ));
        }

        if let (TriggerReason::FieldChanged, Some(field)) = (event.reason, &event.changed_field) {
            let tracked = self.tracked_fields(&event.record_type, &config)?;
            if !tracked.contains(field) {
                tracing::debug!(record_id = event.record_id, field = %field, "ignoring untracked field change");
                return Ok(Disposition::Ignored {
                    reason: format!("field '{field}' is not tracked"),
                });
            }
        }

        let enqueued = self.queue.enqueue(event, now);
        self.queue.persist()?;

        let mut state = self
            .store
            .sync_record(event.record_id)?
            .unwrap_or_else(|| SyncRecord::new(event.record_id));
        state.last_sync_status = SyncStatus::Pending;
        state.pending_reason = self.queue.get(event.record_id).map(|p| p.reason_label());
        state.updated_at = now;
        self.store.put_sync_record(&state)?;

        Ok(match enqueued {
            Enqueued::New { due_at } => Disposition::Queued { due_at },
            Enqueued::Coalesced { due_at } => {
                tracing::debug!(record_id = event.record_id, %due_at, "coalesced with pending sync");
                Disposition::Coalesced { due_at }
            }
        })
    }

    /// Manual single-record sync. Supersedes any pending entry for the record.
    pub async fn sync_now(
        &mut self,
        record_id: RecordId,
        source: &dyn RecordSource,
    ) -> Result<SyncReport> {
        let record = source
            .fetch(record_id)?
            .ok_or(SourceError::NotFound(record_id))?;

        let now = Utc::now();
        let mut trigger =
            PendingSync::immediate(record_id, record.record_type(), TriggerReason::Manual, now);
        if let Some(pending) = self.queue.remove(record_id) {
            trigger.changed_fields = pending.changed_fields;
            self.queue.persist()?;
        }

        let outcome = self.sync_record_at(&record, trigger, now).await?;
        Ok(SyncReport::new(record_id, outcome))
    }

    /// Drain due queue entries and sync them.
    ///
    /// # Errors
    /// Fails fast with [`AuthError::Blocked`] while the auth block is set,
    /// leaving the queue untouched.
    pub async fn process_pending(
        &mut self,
        source: &dyn RecordSource,
        limit: usize,
    ) -> Result<Vec<SyncReport>> {
        self.process_pending_at(source, limit, Utc::now()).await
    }

    pub async fn process_pending_at(
        &mut self,
        source: &dyn RecordSource,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncReport>> {
        if let Some(block) = self.auth_block()? {
            return Err(AuthError::Blocked(block.reason).into());
        }

        let mut due = self.queue.drain_due(now, limit).into_iter();
        let mut reports = Vec::new();

        while let Some(entry) = due.next() {
            let record_id = entry.record_id;
            let record = match source.fetch(record_id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.audit.record(
                        AuditEntry::new(
                            AuditLevel::Warning,
                            AuditCategory::Queue,
                            format!("Record {record_id} no longer exists; dropped from queue"),
                        )
                        .for_record(record_id)
                        .with("trigger", entry.reason_label()),
                    );
                    reports.push(SyncReport::new(
                        record_id,
                        SyncOutcome::Ineligible {
                            reason: "record not found".into(),
                        },
                    ));
                    continue;
                }
                Err(e) => {
                    self.queue.restore(entry);
                    due.for_each(|rest| self.queue.restore(rest));
                    self.queue.persist()?;
                    return Err(e.into());
                }
            };

            let outcome = match self.sync_record_at(&record, entry.clone(), now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.queue.restore(entry);
                    due.for_each(|rest| self.queue.restore(rest));
                    if let Err(persist) = self.queue.persist() {
                        tracing::warn!(error = %persist, "failed to persist restored queue");
                    }
                    return Err(e);
                }
            };
            let halt = outcome.is_auth_failure();
            reports.push(SyncReport::new(record_id, outcome));
            if halt {
                let remaining: Vec<_> = due.by_ref().collect();
                tracing::warn!(remaining = remaining.len(), "authentication failed, leaving remaining syncs queued");
                for rest in remaining {
                    self.queue.restore(rest);
                }
                break;
            }
        }

        self.queue.persist()?;
        Ok(reports)
    }

    /// Run the state machine for one record.
    pub async fn sync_record(&mut self, record: &dyn Record, trigger: PendingSync) -> Result<SyncOutcome> {
        self.sync_record_at(record, trigger, Utc::now()).await
    }

    async fn sync_record_at(
        &mut self,
        record: &dyn Record,
        trigger: PendingSync,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome> {
        let record_id = record.id();
        self.phase(record_id, SyncPhase::Triggered);

        let mut state = self
            .store
            .sync_record(record_id)?
            .unwrap_or_else(|| SyncRecord::new(record_id));
        state.attempts = trigger.attempts + 1;
        state.pending_reason = Some(trigger.reason_label());
        let mut context = trigger_context(record, &trigger);

        if let Some(block) = self.auth_block()? {
            let message = format!(
                "integration halted since {} after authentication failure: {}",
                block.since.format("%Y-%m-%d %H:%M:%S UTC"),
                block.reason
            );
            return self.fail(record_id, state, trigger, FailureKind::Authentication, message, context, AuditCategory::Authentication, now);
        }

        self.phase(record_id, SyncPhase::Validating);
        if let Eligibility::Ineligible(reason) = self.validator.check_with_context(record, &self.hooks, context.clone()) {
            self.phase(record_id, SyncPhase::Ineligible);
            let message = reason.to_string();
            state.last_sync_status = SyncStatus::Ineligible;
            state.last_error = Some(message.clone());
            state.pending_reason = None;
            state.updated_at = now;
            self.store.put_sync_record(&state)?;

            context.insert("check".into(), Value::from(reason.check()));
            self.hooks.notify_failure(record_id, &message, &context);
            let outcome = SyncOutcome::Ineligible { reason: message };
            self.hooks.notify_synced(record_id, &outcome);
            return Ok(outcome);
        }

        let config = self
            .record_types
            .get(record.record_type())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownRecordType(record.record_type().to_string()))?;

        self.phase(record_id, SyncPhase::Transforming);
        let snapshot = self.registry.snapshot(record.record_type())?;
        let metadata = [PayloadMetadata::platform(&self.settings)];
        let payload = match build_payload(record, &snapshot, &self.hooks, &metadata) {
            Ok(payload) => payload,
            Err(e) => {
                context.insert("field".into(), Value::from(e.local_key()));
                return self.fail(record_id, state, trigger, FailureKind::Transformation, e.to_string(), context, AuditCategory::Transformation, now);
            }
        };

        self.phase(record_id, SyncPhase::Calling);
        let external_id = record_id.to_string();
        let result = self
            .api
            .upsert(&config.remote_object_name, &config.external_id_field, &external_id, &payload)
            .await;

        match result {
            Ok(result) => {
                self.phase(record_id, SyncPhase::Success);
                state.remote_external_id = Some(external_id);
                state.remote_id = Some(result.remote_id.clone());
                state.last_synced_at = Some(now);
                state.last_sync_status = SyncStatus::Success;
                state.last_error = None;
                state.pending_reason = None;
                state.attempts = 0;
                state.updated_at = now;
                self.store.put_sync_record(&state)?;

                let verb = if result.created { "created" } else { "updated" };
                self.audit.record(
                    AuditEntry::new(
                        AuditLevel::Info,
                        AuditCategory::Sync,
                        format!(
                            "Record {record_id} {verb} as {} {}",
                            config.remote_object_name, result.remote_id
                        ),
                    )
                    .for_record(record_id)
                    .with_context(context)
                    .with("remote_id", result.remote_id.as_str())
                    .with("created", result.created)
                    .with("fields", payload.len()),
                );

                let outcome = SyncOutcome::Synced {
                    remote_id: result.remote_id,
                    created: result.created,
                };
                self.hooks.notify_synced(record_id, &outcome);
                Ok(outcome)
            }
            Err(err) => {
                if let Some(status) = err.status {
                    context.insert("status".into(), Value::from(status));
                }
                if let Some(body) = &err.body {
                    context.insert("response".into(), Value::from(body.as_str()));
                }
                context.insert("object".into(), Value::from(config.remote_object_name.as_str()));

                match err.kind {
                    ApiErrorKind::Authentication => {
                        self.latch_auth_block(&err.to_string(), now)?;
                        self.alerter.alert(
                            "CRM authentication failed",
                            &format!("Syncing is halted until the connection test passes: {err}"),
                        );
                        self.fail(record_id, state, trigger, FailureKind::Authentication, err.to_string(), context, AuditCategory::Authentication, now)
                    }
                    ApiErrorKind::Transient if trigger.attempts < self.settings.max_requeues => {
                        self.phase(record_id, SyncPhase::Retryable);
                        let attempt = trigger.attempts + 1;
                        let delay = self.requeue_delay(trigger.attempts);
                        let due_at = now + delay;
                        self.queue.requeue(trigger, delay, now);
                        self.queue.persist()?;

                        state.last_sync_status = SyncStatus::Retrying;
                        state.last_error = Some(err.to_string());
                        state.updated_at = now;
                        self.store.put_sync_record(&state)?;

                        self.audit.record(
                            AuditEntry::new(
                                AuditLevel::Warning,
                                AuditCategory::Queue,
                                format!("Record {record_id} re-queued after transient failure: {err}"),
                            )
                            .for_record(record_id)
                            .with_context(context)
                            .with("next_attempt_at", due_at.to_rfc3339()),
                        );

                        let outcome = SyncOutcome::Retrying {
                            message: err.to_string(),
                            attempt,
                        };
                        self.hooks.notify_synced(record_id, &outcome);
                        Ok(outcome)
                    }
                    ApiErrorKind::Transient => {
                        let message = format!("gave up after {} attempts: {err}", trigger.attempts + 1);
                        self.fail(record_id, state, trigger, FailureKind::Transient, message, context, AuditCategory::Api, now)
                    }
                    ApiErrorKind::Permanent => {
                        self.fail(record_id, state, trigger, FailureKind::Permanent, err.to_string(), context, AuditCategory::Api, now)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &mut self,
        record_id: RecordId,
        mut state: SyncRecord,
        trigger: PendingSync,
        kind: FailureKind,
        message: String,
        context: AuditContext,
        category: AuditCategory,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome> {
        self.phase(record_id, SyncPhase::Failed);

        // Host edits blocked by credentials stay queued for after the fix.
        let keep_queued = kind == FailureKind::Authentication && trigger.is_automatic();
        state.last_sync_status = SyncStatus::Failed;
        state.last_error = Some(message.clone());
        state.pending_reason = keep_queued.then(|| trigger.reason_label());
        state.updated_at = now;
        self.store.put_sync_record(&state)?;
        if keep_queued {
            self.queue.restore(trigger);
            self.queue.persist()?;
        }

        self.audit.record(
            AuditEntry::new(
                AuditLevel::Error,
                category,
                format!("Sync failed for record {record_id}: {message}"),
            )
            .for_record(record_id)
            .with_context(context.clone())
            .with("failure", kind.as_str()),
        );
        self.hooks.notify_failure(record_id, &message, &context);

        let outcome = SyncOutcome::Failed { kind, message };
        self.hooks.notify_synced(record_id, &outcome);
        Ok(outcome)
    }

    fn latch_auth_block(&self, reason: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        if self.auth_block()?.is_some() {
            return Ok(());
        }
        save_json(
            self.store.as_ref(),
            AUTH_BLOCK_KEY,
            &AuthBlock {
                since: now,
                reason: reason.to_string(),
            },
        )
    }

    fn requeue_delay(&self, attempts: u32) -> Duration {
        let base = self.settings.requeue_base_secs.max(1) as i64;
        Duration::seconds(base.saturating_mul(1i64 << attempts.min(10)))
    }

    fn phase(&self, record_id: RecordId, phase: SyncPhase) {
        tracing::debug!(record_id, phase = phase.as_str(), "sync phase");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::error::{ApiError, CoreError};
    use crate::mapping::{FieldMapping, Strategy};
    use crate::record::{ContentRecord, InMemorySource};
    use crate::remote::InMemoryCrm;
    use crate::storage::MemoryStore;
    use crate::sync::alert::RecordingAlerter;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Memory store whose sync-record reads can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
    }

    impl StateStore for FlakyStore {
        fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
            self.inner.kv_get(key)
        }

        fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
            self.inner.kv_set(key, value)
        }

        fn kv_delete(&self, key: &str) -> Result<(), DatabaseError> {
            self.inner.kv_delete(key)
        }

        fn sync_record(&self, record_id: RecordId) -> Result<Option<SyncRecord>, DatabaseError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(DatabaseError::Locked);
            }
            self.inner.sync_record(record_id)
        }

        fn put_sync_record(&self, record: &SyncRecord) -> Result<(), DatabaseError> {
            self.inner.put_sync_record(record)
        }

        fn append_audit(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
            self.inner.append_audit(entry)
        }

        fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, DatabaseError> {
            self.inner.audit_entries(filter)
        }
    }

    fn listing(id: RecordId) -> ContentRecord {
        ContentRecord::new(id, "post", "publish")
            .with_field("post_title", format!("Listing {id}"))
            .with_field("quantity", "10")
            .with_field("average_weight_per_load", 5.5)
    }

    fn orchestrator() -> SyncOrchestrator<InMemoryCrm> {
        SyncOrchestrator::new(
            &Config::default(),
            Arc::new(MemoryStore::new()),
            InMemoryCrm::new(),
            SyncQueue::in_memory(Duration::seconds(3)),
        )
    }

    fn errors(orch: &SyncOrchestrator<InMemoryCrm>) -> Vec<AuditEntry> {
        orch.audit()
            .recent(&AuditFilter {
                level: Some(AuditLevel::Error),
                ..Default::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn triggers_in_window_produce_one_remote_call() {
        let mut orch = orchestrator();
        let source = InMemorySource::new(vec![listing(1)]);
        let now = Utc::now();

        let first = orch.handle_event_at(&SyncEvent::save(1, "post"), &source, now).await.unwrap();
        assert!(matches!(first, Disposition::Queued { .. }));
        let second = orch
            .handle_event_at(&SyncEvent::field_changed(1, "post", "quantity"), &source, now + Duration::seconds(1))
            .await
            .unwrap();
        assert!(matches!(second, Disposition::Coalesced { .. }));
        assert_eq!(orch.sync_state(1).unwrap().unwrap().last_sync_status, SyncStatus::Pending);

        assert!(orch.process_pending_at(&source, 10, now + Duration::seconds(2)).await.unwrap().is_empty());
        let reports = orch
            .process_pending_at(&source, 10, now + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].outcome.is_success());
        assert_eq!(orch.api().calls(), 1);

        let state = orch.sync_state(1).unwrap().unwrap();
        assert_eq!(state.last_sync_status, SyncStatus::Success);
        assert_eq!(state.remote_external_id.as_deref(), Some("1"));
        assert!(state.last_synced_at.is_some());

        let payload = orch.api().object("Listing__c", "1").unwrap();
        assert_eq!(payload["Total_Weight__c"], json!(55.0));
        assert_eq!(payload["Source_Platform__c"], "cms");
    }

    #[tokio::test]
    async fn untracked_field_changes_are_ignored() {
        let mut orch = orchestrator();
        let source = InMemorySource::new(vec![listing(1)]);

        let ignored = orch
            .handle_event(&SyncEvent::field_changed(1, "post", "_edit_lock"), &source)
            .await
            .unwrap();
        assert!(matches!(ignored, Disposition::Ignored { .. }));
        assert!(orch.queue().is_empty());

        let other_type = orch.handle_event(&SyncEvent::save(1, "page"), &source).await.unwrap();
        assert!(matches!(other_type, Disposition::Ignored { .. }));
    }

    #[tokio::test]
    async fn manual_event_runs_immediately_and_upsert_is_idempotent() {
        let mut orch = orchestrator();
        let source = InMemorySource::new(vec![listing(4)]);

        let first = orch.handle_event(&SyncEvent::manual(4, "post"), &source).await.unwrap();
        let Disposition::Completed(report) = first else {
            panic!("manual event should complete immediately");
        };
        assert_eq!(
            report.outcome,
            SyncOutcome::Synced {
                remote_id: "Listing__c-1".into(),
                created: true
            }
        );

        let again = orch.sync_now(4, &source).await.unwrap();
        assert_eq!(
            again.outcome,
            SyncOutcome::Synced {
                remote_id: "Listing__c-1".into(),
                created: false
            }
        );
        assert!(again.message.contains("updated"));
        assert_eq!(orch.api().len(), 1);
    }

    #[tokio::test]
    async fn ineligible_record_notifies_failure_observers_without_remote_call() {
        let mut orch = orchestrator();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();
        orch.hooks_mut()
            .register_sync_failure_observer("collect", move |id, message, _| {
                seen.lock().unwrap().push((id, message.to_string()));
            });

        let draft = ContentRecord::new(2, "post", "draft").with_field("post_title", "x");
        let outcome = orch
            .sync_record(&draft, PendingSync::immediate(2, "post", TriggerReason::Save, Utc::now()))
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Ineligible { .. }));
        assert_eq!(orch.api().calls(), 0);
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert_eq!(
            orch.sync_state(2).unwrap().unwrap().last_sync_status,
            SyncStatus::Ineligible
        );
    }

    #[tokio::test]
    async fn ineligible_warning_records_the_trigger() {
        let mut orch = orchestrator();
        let draft = ContentRecord::new(3, "post", "draft").with_field("post_title", "x");
        let mut trigger = PendingSync::immediate(3, "post", TriggerReason::Save, Utc::now());
        trigger.changed_fields.insert("quantity".into());
        orch.sync_record(&draft, trigger).await.unwrap();

        let warnings = orch
            .audit()
            .recent(&AuditFilter {
                level: Some(AuditLevel::Warning),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].category, AuditCategory::Validation);
        assert_eq!(warnings[0].context["trigger"], "save");
        assert_eq!(warnings[0].context["changed_fields"], json!(["quantity"]));
        assert_eq!(warnings[0].context["check"], "status");
    }

    #[tokio::test]
    async fn store_failure_mid_batch_keeps_entries_queued() {
        let store = Arc::new(FlakyStore::default());
        let mut orch = SyncOrchestrator::new(
            &Config::default(),
            store.clone(),
            InMemoryCrm::new(),
            SyncQueue::in_memory(Duration::seconds(3)),
        );
        let source = InMemorySource::new(vec![listing(1), listing(2), listing(3)]);
        let now = Utc::now();
        for id in 1..=3 {
            orch.handle_event_at(&SyncEvent::save(id, "post"), &source, now).await.unwrap();
        }
        assert_eq!(orch.queue().len(), 3);

        store.fail_reads.store(true, Ordering::SeqCst);
        let err = orch
            .process_pending_at(&source, 10, now + Duration::seconds(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Database(DatabaseError::Locked)));
        assert_eq!(orch.queue().len(), 3);
        assert_eq!(orch.api().calls(), 0);

        store.fail_reads.store(false, Ordering::SeqCst);
        let reports = orch
            .process_pending_at(&source, 10, now + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(orch.queue().is_empty());
    }

    #[tokio::test]
    async fn authentication_failure_alerts_and_blocks() {
        let alerts = Arc::new(RecordingAlerter::new());
        let mut orch = orchestrator().with_alerter(alerts.clone());
        let source = InMemorySource::new(vec![listing(1), listing(2)]);
        orch.api()
            .fail_next(ApiError::authentication("token rejected after re-authentication").with_status(401));

        let report = orch.sync_now(1, &source).await.unwrap();
        assert!(report.outcome.is_auth_failure());
        assert_eq!(alerts.alerts().len(), 1);
        assert!(orch.auth_block().unwrap().is_some());

        let blocked = orch.sync_now(2, &source).await.unwrap();
        assert!(blocked.outcome.is_auth_failure());
        assert_eq!(orch.api().calls(), 1);
        assert_eq!(alerts.alerts().len(), 1);

        orch.handle_event(&SyncEvent::save(2, "post"), &source).await.unwrap();
        let err = orch
            .process_pending_at(&source, 10, Utc::now() + Duration::seconds(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Auth(AuthError::Blocked(_))));
        assert_eq!(orch.queue().len(), 1);

        let entries = errors(&orch);
        assert!(entries
            .iter()
            .any(|e| e.category == AuditCategory::Authentication && e.record_id == Some(1)));

        assert!(orch.test_connection().await.unwrap().ok);
        assert!(orch.auth_block().unwrap().is_none());
        let reports = orch
            .process_pending_at(&source, 10, Utc::now() + Duration::seconds(10))
            .await
            .unwrap();
        assert!(reports[0].outcome.is_success());
    }

    #[tokio::test]
    async fn queued_sync_blocked_by_auth_stays_queued() {
        let mut orch = orchestrator();
        let source = InMemorySource::new(vec![listing(1), listing(2)]);
        let now = Utc::now();
        orch.handle_event_at(&SyncEvent::save(1, "post"), &source, now).await.unwrap();
        orch.handle_event_at(&SyncEvent::save(2, "post"), &source, now + Duration::seconds(1)).await.unwrap();
        orch.api().fail_next(ApiError::authentication("rejected").with_status(401));

        let reports = orch
            .process_pending_at(&source, 10, now + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].outcome.is_auth_failure());
        assert_eq!(orch.queue().len(), 2);
        assert_eq!(orch.api().calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_requeue_until_limit() {
        let mut config = Config::default();
        config.sync.max_requeues = 1;
        let mut orch = SyncOrchestrator::new(
            &config,
            Arc::new(MemoryStore::new()),
            InMemoryCrm::new(),
            SyncQueue::in_memory(Duration::seconds(3)),
        );
        let source = InMemorySource::new(vec![listing(1)]);
        orch.api().fail_next(ApiError::transient("HTTP 503").with_status(503));
        orch.api().fail_next(ApiError::transient("HTTP 503").with_status(503));

        let first = orch.sync_now(1, &source).await.unwrap();
        assert!(matches!(first.outcome, SyncOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(orch.queue().get(1).unwrap().attempts, 1);
        assert_eq!(
            orch.sync_state(1).unwrap().unwrap().last_sync_status,
            SyncStatus::Retrying
        );

        let later = Utc::now() + Duration::hours(1);
        let reports = orch.process_pending_at(&source, 10, later).await.unwrap();
        assert!(matches!(
            reports[0].outcome,
            SyncOutcome::Failed {
                kind: FailureKind::Transient,
                ..
            }
        ));
        assert!(orch.queue().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_audited_with_response() {
        let mut orch = orchestrator();
        let source = InMemorySource::new(vec![listing(1)]);
        orch.api().fail_next(
            ApiError::from_status(400, r#"[{"message":"bad Quantity__c"}]"#),
        );

        let report = orch.sync_now(1, &source).await.unwrap();
        assert!(matches!(
            report.outcome,
            SyncOutcome::Failed {
                kind: FailureKind::Permanent,
                ..
            }
        ));
        let entry = &errors(&orch)[0];
        assert_eq!(entry.category, AuditCategory::Api);
        assert_eq!(entry.context["status"], 400);
        assert_eq!(entry.context["trigger"], "manual");
        assert!(orch.queue().is_empty());
    }

    #[tokio::test]
    async fn malformed_mapping_fails_before_remote_call() {
        let mut orch = orchestrator();
        orch.registry_mut().register_field_mapping_override(
            "post",
            FieldMapping::new("quantity", "Quantity__c")
                .with_strategy(Strategy::Numeric)
                .with_param("precision", "high"),
        );
        let source = InMemorySource::new(vec![listing(1)]);

        let report = orch.sync_now(1, &source).await.unwrap();
        assert!(matches!(
            report.outcome,
            SyncOutcome::Failed {
                kind: FailureKind::Transformation,
                ..
            }
        ));
        assert_eq!(orch.api().calls(), 0);
        assert_eq!(errors(&orch)[0].context["field"], "quantity");
    }

    #[tokio::test]
    async fn missing_record_is_an_error_for_manual_sync() {
        let mut orch = orchestrator();
        let source = InMemorySource::default();
        assert!(matches!(
            orch.sync_now(99, &source).await,
            Err(CoreError::Source(SourceError::NotFound(99)))
        ));
    }
}
