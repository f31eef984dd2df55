//! SQLite-backed state store.
//!
//! Provides persistent storage for:
//! - Key-value state (token cache, saved mappings, cursors, auth block)
//! - Per-record sync state
//! - The append-only audit log

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{data_dir, migrations, StateStore};
use crate::audit::{AuditContext, AuditEntry, AuditFilter};
use crate::error::DatabaseError;
use crate::record::RecordId;
use crate::sync::types::{SyncRecord, SyncStatus};

/// SQLite database for sync state and the audit trail.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open the database at `<data_dir>/fieldbridge.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, DatabaseError> {
        let dir = data_dir().map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        Self::open_at(dir.join("fieldbridge.db"))
    }

    /// Open (or create) the database at an explicit path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|source| DatabaseError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::Locked)
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_sync_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
    let status: String = row.get(4)?;
    Ok(SyncRecord {
        record_id: row.get(0)?,
        remote_external_id: row.get(1)?,
        remote_id: row.get(2)?,
        last_synced_at: parse_time(row.get(3)?),
        last_sync_status: status.parse().unwrap_or(SyncStatus::Never),
        pending_reason: row.get(5)?,
        last_error: row.get(6)?,
        attempts: row.get(7)?,
        updated_at: parse_time(Some(row.get(8)?)).unwrap_or_else(Utc::now),
    })
}

fn row_to_audit_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let timestamp: String = row.get(2)?;
    let level: String = row.get(3)?;
    let context: String = row.get(5)?;
    let category: String = row.get(6)?;
    let invalid = |col: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            msg.into(),
        )
    };
    Ok(AuditEntry {
        id: row.get(0)?,
        record_id: row.get(1)?,
        timestamp: parse_time(Some(timestamp)).unwrap_or_else(Utc::now),
        level: level.parse().map_err(|e| invalid(3, e))?,
        message: row.get(4)?,
        context: serde_json::from_str::<AuditContext>(&context).unwrap_or_default(),
        category: category.parse().map_err(|e| invalid(6, e))?,
    })
}

impl StateStore for SqliteStore {
    fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn kv_delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()?
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn sync_record(&self, record_id: RecordId) -> Result<Option<SyncRecord>, DatabaseError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT record_id, remote_external_id, remote_id, last_synced_at,
                        last_sync_status, pending_reason, last_error, attempts, updated_at
                 FROM sync_records WHERE record_id = ?1",
                params![record_id],
                row_to_sync_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put_sync_record(&self, record: &SyncRecord) -> Result<(), DatabaseError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO sync_records
                (record_id, remote_external_id, remote_id, last_synced_at,
                 last_sync_status, pending_reason, last_error, attempts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.record_id,
                record.remote_external_id,
                record.remote_id,
                record.last_synced_at.map(|t| t.to_rfc3339()),
                record.last_sync_status.as_str(),
                record.pending_reason,
                record.last_error,
                record.attempts,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let context = serde_json::to_string(&entry.context).map_err(|e| DatabaseError::Corrupt {
            key: "audit_log.context".to_string(),
            message: e.to_string(),
        })?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (record_id, timestamp, level, message, context, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.record_id,
                entry.timestamp.to_rfc3339(),
                entry.level.as_str(),
                entry.message,
                context,
                entry.category.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, record_id, timestamp, level, message, context, category
             FROM audit_log
             WHERE (?1 IS NULL OR record_id = ?1)
               AND (?2 IS NULL OR category = ?2)
               AND (?3 IS NULL OR level = ?3)
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                filter.record_id,
                filter.category.map(|c| c.as_str()),
                filter.level.map(|l| l.as_str()),
                filter.limit as i64,
            ],
            row_to_audit_entry,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
