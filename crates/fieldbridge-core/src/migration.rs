//! Resumable full-corpus backfill.
//!
//! A [`MigrationRun`] walks every record of one type in ascending id order and
//! pushes each through the orchestrator. Progress is persisted under
//! `migration:<record_type>` after every record, so an interrupted run picks up
//! where it stopped. An authentication failure halts the run without moving
//! the cursor past the failed record.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditCategory, AuditEntry, AuditLevel};
use crate::error::{ConfigError, DatabaseError, Result};
use crate::record::{ContentRecord, RecordId, RecordSource};
use crate::remote::CrmApi;
use crate::storage::{load_json, save_json, MigrationConfig, StateStore};
use crate::sync::{PendingSync, SyncOrchestrator, SyncOutcome, SyncReport, TriggerReason};

fn state_key(record_type: &str) -> String {
    format!("migration:{record_type}")
}

/// Persisted progress of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    pub record_type: String,
    /// Last record whose outcome is settled. `None` before the first record
    /// and after completion.
    pub cursor: Option<RecordId>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub ineligible: u64,
    pub requeued: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub halted_reason: Option<String>,
}

impl MigrationState {
    fn fresh(record_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            record_type: record_type.to_string(),
            cursor: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            ineligible: 0,
            requeued: 0,
            started_at: now,
            completed_at: None,
            halted_reason: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn summary(&self) -> MigrationSummary {
        MigrationSummary {
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            ineligible: self.ineligible,
            requeued: self.requeued,
        }
    }

    fn count(&mut self, outcome: &SyncOutcome) {
        self.processed += 1;
        match outcome {
            SyncOutcome::Synced { .. } => self.succeeded += 1,
            SyncOutcome::Ineligible { .. } => self.ineligible += 1,
            SyncOutcome::Retrying { .. } => self.requeued += 1,
            SyncOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Outcome counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub ineligible: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub page_size: usize,
    /// Pause between consecutive records.
    pub delay: Duration,
    /// Stop after this many records in this invocation. The cursor is kept.
    pub limit: Option<usize>,
}

impl From<&MigrationConfig> for MigrationOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            delay: Duration::from_millis(config.delay_ms),
            limit: None,
        }
    }
}

/// One record's result within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationItem {
    pub report: SyncReport,
    /// Whether this record stopped the run.
    pub halted: bool,
}

/// A lazy, finite walk over one record type.
pub struct MigrationRun<'a, A> {
    orchestrator: &'a mut SyncOrchestrator<A>,
    source: &'a dyn RecordSource,
    options: MigrationOptions,
    state: MigrationState,
    page: VecDeque<ContentRecord>,
    exhausted: bool,
    halted: bool,
    handled: usize,
}

impl<'a, A: CrmApi> MigrationRun<'a, A> {
    /// Begin or resume a migration for `record_type`.
    ///
    /// An unfinished run continues after its cursor; a completed one starts over.
    pub fn start(
        orchestrator: &'a mut SyncOrchestrator<A>,
        source: &'a dyn RecordSource,
        record_type: &str,
        options: MigrationOptions,
    ) -> Result<Self> {
        if !orchestrator.syncs_record_type(record_type) {
            return Err(ConfigError::UnknownRecordType(record_type.to_string()).into());
        }

        let store = orchestrator.store();
        let now = Utc::now();
        let state = match load_json::<MigrationState>(store.as_ref(), &state_key(record_type))? {
            Some(previous) if !previous.is_complete() => {
                let mut state = previous;
                state.halted_reason = None;
                state
            }
            _ => MigrationState::fresh(record_type, now),
        };

        let resumed = state.cursor.is_some();
        orchestrator.audit().record(
            AuditEntry::new(
                AuditLevel::Info,
                AuditCategory::Migration,
                if resumed {
                    format!("Migration of '{record_type}' resumed")
                } else {
                    format!("Migration of '{record_type}' started")
                },
            )
            .with("record_type", record_type)
            .with("cursor", state.cursor)
            .with("page_size", options.page_size),
        );
        save_json(store.as_ref(), &state_key(record_type), &state)?;

        Ok(Self {
            orchestrator,
            source,
            options,
            state,
            page: VecDeque::new(),
            exhausted: false,
            halted: false,
            handled: 0,
        })
    }

    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    pub fn summary(&self) -> MigrationSummary {
        self.state.summary()
    }

    /// Sync the next record. `None` once the corpus is exhausted, the run was
    /// halted, or the per-invocation limit is reached.
    pub async fn next(&mut self) -> Result<Option<MigrationItem>> {
        if self.halted || self.options.limit.is_some_and(|limit| self.handled >= limit) {
            return Ok(None);
        }

        let Some(record) = self.next_record()? else {
            self.complete()?;
            return Ok(None);
        };

        if self.handled > 0 && !self.options.delay.is_zero() {
            tokio::time::sleep(self.options.delay).await;
        }
        self.handled += 1;

        let record_id = record.id;
        let trigger =
            PendingSync::immediate(record_id, &self.state.record_type, TriggerReason::Migration, Utc::now());
        let outcome = self.orchestrator.sync_record(&record, trigger).await?;
        tracing::info!(
            record_id,
            record_type = %self.state.record_type,
            status = outcome.status().as_str(),
            "migration record processed"
        );

        let halted = outcome.is_auth_failure();
        if halted {
            self.halt(record_id, &outcome)?;
        } else {
            self.state.count(&outcome);
            self.state.cursor = Some(record_id);
            self.persist()?;
        }

        Ok(Some(MigrationItem {
            report: SyncReport::new(record_id, outcome),
            halted,
        }))
    }

    /// Drive the run to its end, discarding per-record items.
    pub async fn run_to_end(&mut self) -> Result<MigrationSummary> {
        while self.next().await?.is_some() {}
        Ok(self.summary())
    }

    fn next_record(&mut self) -> Result<Option<ContentRecord>> {
        if self.page.is_empty() && !self.exhausted {
            let after = self.state.cursor;
            let page = self
                .source
                .list_after(&self.state.record_type, after, self.options.page_size)?;
            tracing::debug!(after, fetched = page.len(), "migration page");
            if page.len() < self.options.page_size {
                self.exhausted = true;
            }
            self.page.extend(page);
        }
        Ok(self.page.pop_front())
    }

    fn complete(&mut self) -> Result<(), DatabaseError> {
        if self.state.is_complete() {
            return Ok(());
        }
        self.state.cursor = None;
        self.state.completed_at = Some(Utc::now());
        self.persist()?;

        let summary = self.summary();
        self.orchestrator.audit().record(
            AuditEntry::new(
                AuditLevel::Info,
                AuditCategory::Migration,
                format!(
                    "Migration of '{}' completed: {} processed, {} succeeded, {} failed, {} ineligible, {} re-queued",
                    self.state.record_type,
                    summary.processed,
                    summary.succeeded,
                    summary.failed,
                    summary.ineligible,
                    summary.requeued
                ),
            )
            .with("record_type", self.state.record_type.as_str()),
        );
        Ok(())
    }

    fn halt(&mut self, record_id: RecordId, outcome: &SyncOutcome) -> Result<(), DatabaseError> {
        self.halted = true;
        let reason = match outcome {
            SyncOutcome::Failed { message, .. } => message.clone(),
            other => other.status().to_string(),
        };
        self.state.halted_reason = Some(reason.clone());
        self.persist()?;

        self.orchestrator.audit().record(
            AuditEntry::new(
                AuditLevel::Error,
                AuditCategory::Migration,
                format!(
                    "Migration of '{}' halted at record {record_id}: {reason}",
                    self.state.record_type
                ),
            )
            .for_record(record_id)
            .with("cursor", self.state.cursor),
        );
        Ok(())
    }

    fn persist(&self) -> Result<(), DatabaseError> {
        let store = self.orchestrator.store();
        save_json(store.as_ref(), &state_key(&self.state.record_type), &self.state)
    }
}

/// Stored progress for `record_type`.
pub fn status(store: &dyn StateStore, record_type: &str) -> Result<Option<MigrationState>, DatabaseError> {
    load_json(store, &state_key(record_type))
}

/// Forget stored progress so the next run starts from the first record.
pub fn reset(store: &dyn StateStore, record_type: &str) -> Result<bool, DatabaseError> {
    let existed = store.kv_get(&state_key(record_type))?.is_some();
    store.kv_delete(&state_key(record_type))?;
    Ok(existed)
}
