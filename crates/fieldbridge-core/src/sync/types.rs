//! Sync state, events and outcomes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::RecordId;

/// Last known sync state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Never,
    Pending,
    Success,
    Ineligible,
    Retrying,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Never => "never",
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Ineligible => "ineligible",
            SyncStatus::Retrying => "retrying",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(SyncStatus::Never),
            "pending" => Ok(SyncStatus::Pending),
            "success" => Ok(SyncStatus::Success),
            "ineligible" => Ok(SyncStatus::Ineligible),
            "retrying" => Ok(SyncStatus::Retrying),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-record sync bookkeeping.
///
/// Created on the first attempt. `remote_external_id` is set once an upsert
/// succeeds and survives later edits of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub record_id: RecordId,
    pub remote_external_id: Option<String>,
    pub remote_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    pub pending_reason: Option<String>,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            remote_external_id: None,
            remote_id: None,
            last_synced_at: None,
            last_sync_status: SyncStatus::Never,
            pending_reason: None,
            last_error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Why a sync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Save,
    FieldChanged,
    Manual,
    Migration,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Save => "save",
            TriggerReason::FieldChanged => "field_changed",
            TriggerReason::Manual => "manual",
            TriggerReason::Migration => "migration",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host-side change the bridge should react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub record_id: RecordId,
    pub record_type: String,
    pub reason: TriggerReason,
    pub changed_field: Option<String>,
}

impl SyncEvent {
    pub fn save(record_id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            reason: TriggerReason::Save,
            changed_field: None,
        }
    }

    pub fn field_changed(
        record_id: RecordId,
        record_type: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            reason: TriggerReason::FieldChanged,
            changed_field: Some(field.into()),
        }
    }

    pub fn manual(record_id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            reason: TriggerReason::Manual,
            changed_field: None,
        }
    }

    pub fn migration(record_id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            reason: TriggerReason::Migration,
            changed_field: None,
        }
    }
}

/// Failure taxonomy of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transformation,
    Authentication,
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Transformation => "transformation",
            FailureKind::Authentication => "authentication",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// Result of running one record through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced { remote_id: String, created: bool },
    Ineligible { reason: String },
    /// Transient failure; the record went back on the queue.
    Retrying { message: String, attempt: u32 },
    Failed { kind: FailureKind, message: String },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Failed {
                kind: FailureKind::Authentication,
                ..
            }
        )
    }

    pub fn status(&self) -> SyncStatus {
        match self {
            SyncOutcome::Synced { .. } => SyncStatus::Success,
            SyncOutcome::Ineligible { .. } => SyncStatus::Ineligible,
            SyncOutcome::Retrying { .. } => SyncStatus::Retrying,
            SyncOutcome::Failed { .. } => SyncStatus::Failed,
        }
    }
}

/// Human-facing summary of a sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub record_id: RecordId,
    pub outcome: SyncOutcome,
    pub message: String,
}

impl SyncReport {
    pub fn new(record_id: RecordId, outcome: SyncOutcome) -> Self {
        let message = match &outcome {
            SyncOutcome::Synced { remote_id, created: true } => {
                format!("record {record_id} created remotely as {remote_id}")
            }
            SyncOutcome::Synced { remote_id, created: false } => {
                format!("record {record_id} updated remotely ({remote_id})")
            }
            SyncOutcome::Ineligible { reason } => {
                format!("record {record_id} not synced: {reason}")
            }
            SyncOutcome::Retrying { message, attempt } => {
                format!("record {record_id} will be retried (attempt {attempt}): {message}")
            }
            SyncOutcome::Failed { kind, message } => {
                format!("record {record_id} failed ({}): {message}", kind.as_str())
            }
        };
        Self {
            record_id,
            outcome,
            message,
        }
    }
}

/// What `handle_event` did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Queued { due_at: DateTime<Utc> },
    /// Merged into a pending entry for the same record.
    Coalesced { due_at: DateTime<Utc> },
    Ignored { reason: String },
    /// Manual events run immediately.
    Completed(SyncReport),
}

/// Orchestrator state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Triggered,
    Validating,
    Ineligible,
    Transforming,
    Calling,
    Success,
    Retryable,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Triggered => "triggered",
            SyncPhase::Validating => "validating",
            SyncPhase::Ineligible => "ineligible",
            SyncPhase::Transforming => "transforming",
            SyncPhase::Calling => "calling",
            SyncPhase::Success => "success",
            SyncPhase::Retryable => "retryable",
            SyncPhase::Failed => "failed",
        }
    }
}
