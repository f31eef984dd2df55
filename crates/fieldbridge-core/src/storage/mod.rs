//! Persistence for mappings, token cache, sync state and the audit trail.
//!
//! Components never reach for global state: they are handed an
//! `Arc<dyn StateStore>` and own a fixed set of keys in it.
//!
//! | owner            | keys / tables                         |
//! |------------------|---------------------------------------|
//! | mapping registry | `mappings:<record_type>`              |
//! | remote client    | `oauth_token`                         |
//! | orchestrator     | `sync_records`, `auth_block`          |
//! | migrations       | `migration:<record_type>`             |
//! | audit trail      | `audit_log`                           |

mod config;
pub mod database;
pub mod memory;
pub mod migrations;

pub use config::{AlertConfig, Config, MigrationConfig, RecordTypeConfig, RemoteConfig, SourceConfig, SyncSettings};
pub use database::SqliteStore;
pub use memory::MemoryStore;

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::audit::{AuditEntry, AuditFilter};
use crate::error::DatabaseError;
use crate::record::RecordId;
use crate::sync::types::SyncRecord;

/// Durable state shared by the pipeline components.
pub trait StateStore: Send + Sync {
    fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    fn kv_delete(&self, key: &str) -> Result<(), DatabaseError>;

    fn sync_record(&self, record_id: RecordId) -> Result<Option<SyncRecord>, DatabaseError>;

    fn put_sync_record(&self, record: &SyncRecord) -> Result<(), DatabaseError>;

    /// Append an audit entry. The entry's `id` is ignored; the assigned id is returned.
    fn append_audit(&self, entry: &AuditEntry) -> Result<i64, DatabaseError>;

    /// Audit entries matching `filter`, newest first.
    fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, DatabaseError>;
}

/// Read a JSON value from the kv store.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, DatabaseError> {
    match store.kv_get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| DatabaseError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Write a JSON value to the kv store.
pub fn save_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), DatabaseError> {
    let raw = serde_json::to_string(value).map_err(|e| DatabaseError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.kv_set(key, &raw)
}

/// Returns `~/.config/fieldbridge[-dev]/` based on FIELDBRIDGE_ENV.
///
/// Set FIELDBRIDGE_ENV=dev to use the development data directory, or
/// FIELDBRIDGE_HOME to point at an explicit directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    if let Ok(home) = std::env::var("FIELDBRIDGE_HOME") {
        let dir = PathBuf::from(home);
        std::fs::create_dir_all(&dir)?;
        return Ok(dir);
    }

    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("FIELDBRIDGE_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("fieldbridge-dev")
    } else {
        base_dir.join("fieldbridge")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cursor {
        last: u64,
    }

    #[test]
    fn json_helpers_roundtrip_through_kv() {
        let store = MemoryStore::new();
        assert!(load_json::<Cursor>(&store, "cursor").unwrap().is_none());

        save_json(&store, "cursor", &Cursor { last: 42 }).unwrap();
        assert_eq!(
            load_json::<Cursor>(&store, "cursor").unwrap(),
            Some(Cursor { last: 42 })
        );
    }

    #[test]
    fn corrupt_json_is_reported_with_key() {
        let store = MemoryStore::new();
        store.kv_set("cursor", "{not json").unwrap();
        let err = load_json::<Cursor>(&store, "cursor").unwrap_err();
        assert!(matches!(err, DatabaseError::Corrupt { ref key, .. } if key == "cursor"));
    }
}
