//! In-memory state store for tests and embedding hosts that bring their own persistence.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::StateStore;
use crate::audit::{AuditEntry, AuditFilter};
use crate::error::DatabaseError;
use crate::record::RecordId;
use crate::sync::types::SyncRecord;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, String>,
    sync_records: HashMap<RecordId, SyncRecord>,
    audit: Vec<AuditEntry>,
}

/// Volatile [`StateStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DatabaseError> {
        self.inner.lock().map_err(|_| DatabaseError::Locked)
    }
}

impl StateStore for MemoryStore {
    fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.lock()?.kv.get(key).cloned())
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.lock()?.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn kv_delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.lock()?.kv.remove(key);
        Ok(())
    }

    fn sync_record(&self, record_id: RecordId) -> Result<Option<SyncRecord>, DatabaseError> {
        Ok(self.lock()?.sync_records.get(&record_id).cloned())
    }

    fn put_sync_record(&self, record: &SyncRecord) -> Result<(), DatabaseError> {
        self.lock()?
            .sync_records
            .insert(record.record_id, record.clone());
        Ok(())
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let mut inner = self.lock()?;
        let id = inner.audit.len() as i64 + 1;
        let mut stored = entry.clone();
        stored.id = id;
        inner.audit.push(stored);
        Ok(id)
    }

    fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, DatabaseError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit)
            .cloned()
            .collect())
    }
}
