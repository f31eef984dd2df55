//! Append-only audit trail of sync attempts.
//!
//! Every entry is written to the state store and mirrored as a `tracing`
//! event at the matching level, so the log stream and the stored trail
//! never disagree.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DatabaseError;
use crate::record::RecordId;
use crate::storage::StateStore;

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warning => "warning",
            AuditLevel::Error => "error",
        }
    }
}

impl FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AuditLevel::Info),
            "warning" | "warn" => Ok(AuditLevel::Warning),
            "error" => Ok(AuditLevel::Error),
            other => Err(format!("unknown audit level: {other}")),
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the pipeline produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Validation,
    Transformation,
    Authentication,
    Api,
    Sync,
    Queue,
    Migration,
    Configuration,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Validation => "validation",
            AuditCategory::Transformation => "transformation",
            AuditCategory::Authentication => "authentication",
            AuditCategory::Api => "api",
            AuditCategory::Sync => "sync",
            AuditCategory::Queue => "queue",
            AuditCategory::Migration => "migration",
            AuditCategory::Configuration => "configuration",
        }
    }
}

impl FromStr for AuditCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(AuditCategory::Validation),
            "transformation" => Ok(AuditCategory::Transformation),
            "authentication" => Ok(AuditCategory::Authentication),
            "api" => Ok(AuditCategory::Api),
            "sync" => Ok(AuditCategory::Sync),
            "queue" => Ok(AuditCategory::Queue),
            "migration" => Ok(AuditCategory::Migration),
            "configuration" => Ok(AuditCategory::Configuration),
            other => Err(format!("unknown audit category: {other}")),
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form structured context attached to an entry.
pub type AuditContext = Map<String, Value>;

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the store on append.
    pub id: i64,
    pub record_id: Option<RecordId>,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub message: String,
    #[serde(default)]
    pub context: AuditContext,
    pub category: AuditCategory,
}

impl AuditEntry {
    pub fn new(level: AuditLevel, category: AuditCategory, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            record_id: None,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            context: AuditContext::new(),
            category,
        }
    }

    pub fn for_record(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_context(mut self, context: AuditContext) -> Self {
        self.context.extend(context);
        self
    }
}

/// Filter for listing recent entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFilter {
    pub record_id: Option<RecordId>,
    pub category: Option<AuditCategory>,
    pub level: Option<AuditLevel>,
    pub limit: usize,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            record_id: None,
            category: None,
            level: None,
            limit: 50,
        }
    }
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.record_id.map_or(true, |id| entry.record_id == Some(id))
            && self.category.map_or(true, |c| entry.category == c)
            && self.level.map_or(true, |l| entry.level == l)
    }
}

/// Writes audit entries to the store and the log.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn StateStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Append an entry. Store failures are logged, never propagated.
    pub fn record(&self, entry: AuditEntry) -> Option<i64> {
        emit(&entry);
        match self.store.append_audit(&entry) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, message = %entry.message, "failed to persist audit entry");
                None
            }
        }
    }

    pub fn info(&self, category: AuditCategory, record_id: Option<RecordId>, message: impl Into<String>) {
        let mut entry = AuditEntry::new(AuditLevel::Info, category, message);
        entry.record_id = record_id;
        self.record(entry);
    }

    pub fn recent(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, DatabaseError> {
        self.store.audit_entries(filter)
    }
}

fn emit(entry: &AuditEntry) {
    let context = Value::Object(entry.context.clone());
    match entry.level {
        AuditLevel::Info => tracing::info!(
            category = entry.category.as_str(),
            record_id = entry.record_id,
            %context,
            "{}",
            entry.message
        ),
        AuditLevel::Warning => tracing::warn!(
            category = entry.category.as_str(),
            record_id = entry.record_id,
            %context,
            "{}",
            entry.message
        ),
        AuditLevel::Error => tracing::error!(
            category = entry.category.as_str(),
            record_id = entry.record_id,
            %context,
            "{}",
            entry.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn entries_are_listed_newest_first_with_assigned_ids() {
        let store = Arc::new(MemoryStore::new());
        let trail = AuditTrail::new(store.clone());

        let first = trail
            .record(AuditEntry::new(AuditLevel::Info, AuditCategory::Sync, "one").for_record(1))
            .unwrap();
        let second = trail
            .record(AuditEntry::new(AuditLevel::Error, AuditCategory::Api, "two").for_record(2))
            .unwrap();
        assert!(second > first);

        let all = trail.recent(&AuditFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "two");
        assert_eq!(all[1].id, first);
    }

    #[test]
    fn filter_by_record_and_category() {
        let store = Arc::new(MemoryStore::new());
        let trail = AuditTrail::new(store);

        trail.record(AuditEntry::new(AuditLevel::Info, AuditCategory::Sync, "a").for_record(1));
        trail.record(AuditEntry::new(AuditLevel::Warning, AuditCategory::Validation, "b").for_record(1));
        trail.record(AuditEntry::new(AuditLevel::Warning, AuditCategory::Validation, "c").for_record(2));

        let filter = AuditFilter {
            record_id: Some(1),
            category: Some(AuditCategory::Validation),
            ..Default::default()
        };
        let found = trail.recent(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "b");
    }

    #[test]
    fn context_is_kept() {
        let entry = AuditEntry::new(AuditLevel::Error, AuditCategory::Api, "rejected")
            .with("status", 400)
            .with("field", "Quantity__c");
        assert_eq!(entry.context["status"], 400);
        assert_eq!(entry.context["field"], "Quantity__c");
    }

    #[test]
    fn level_and_category_parse() {
        assert_eq!("warn".parse::<AuditLevel>().unwrap(), AuditLevel::Warning);
        assert_eq!(
            "authentication".parse::<AuditCategory>().unwrap(),
            AuditCategory::Authentication
        );
        assert!("nope".parse::<AuditCategory>().is_err());
    }
}
