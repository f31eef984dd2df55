//! Persisted sync queue with debounce support.
//!
//! A trigger marks a record pending with `due_at = now + window`. Further
//! triggers for the same record inside the window slide `due_at` forward and
//! merge their reasons, so a burst of saves becomes one remote call.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::RecordId;
use crate::storage::data_dir;
use crate::sync::types::{SyncEvent, TriggerReason};

/// A record waiting to be synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSync {
    pub record_id: RecordId,
    pub record_type: String,
    pub reasons: BTreeSet<TriggerReason>,
    pub changed_fields: BTreeSet<String>,
    pub first_triggered_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    /// Transient failures so far.
    #[serde(default)]
    pub attempts: u32,
}

impl PendingSync {
    /// An entry for a sync that runs right away rather than from the queue.
    pub fn immediate(
        record_id: RecordId,
        record_type: impl Into<String>,
        reason: TriggerReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            reasons: BTreeSet::from([reason]),
            changed_fields: BTreeSet::new(),
            first_triggered_at: now,
            due_at: now,
            attempts: 0,
        }
    }

    /// Whether the entry came from host edits rather than an operator.
    pub fn is_automatic(&self) -> bool {
        self.reasons
            .iter()
            .any(|r| matches!(r, TriggerReason::Save | TriggerReason::FieldChanged))
    }

    /// Comma-joined trigger reasons, for audit context.
    pub fn reason_label(&self) -> String {
        self.reasons
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Result of enqueueing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    New { due_at: DateTime<Utc> },
    Coalesced { due_at: DateTime<Utc> },
}

/// Debounced queue of pending syncs keyed by record id.
pub struct SyncQueue {
    pending: HashMap<RecordId, PendingSync>,
    window: Duration,
    /// `None` keeps the queue in memory only.
    queue_file: Option<PathBuf>,
}

impl SyncQueue {
    /// Queue persisted at `<data_dir>/sync_queue.json`.
    pub fn new(window: Duration) -> Self {
        let data_dir = data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new_with_path(data_dir.join("sync_queue.json"), window)
    }

    /// Queue persisted at a specific path.
    pub fn new_with_path(path: PathBuf, window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
            queue_file: Some(path),
        }
    }

    pub fn in_memory(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
            queue_file: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Mark the event's record pending, sliding its due time forward.
    pub fn enqueue(&mut self, event: &SyncEvent, now: DateTime<Utc>) -> Enqueued {
        let due_at = now + self.window;
        match self.pending.get_mut(&event.record_id) {
            Some(entry) => {
                entry.reasons.insert(event.reason);
                if let Some(field) = &event.changed_field {
                    entry.changed_fields.insert(field.clone());
                }
                entry.due_at = entry.due_at.max(due_at);
                Enqueued::Coalesced {
                    due_at: entry.due_at,
                }
            }
            None => {
                let mut entry = PendingSync {
                    record_id: event.record_id,
                    record_type: event.record_type.clone(),
                    reasons: BTreeSet::from([event.reason]),
                    changed_fields: BTreeSet::new(),
                    first_triggered_at: now,
                    due_at,
                    attempts: 0,
                };
                if let Some(field) = &event.changed_field {
                    entry.changed_fields.insert(field.clone());
                }
                self.pending.insert(event.record_id, entry);
                Enqueued::New { due_at }
            }
        }
    }

    /// Put a drained entry back after a transient failure.
    ///
    /// If the record was re-triggered meanwhile, the two entries are merged.
    pub fn requeue(&mut self, mut entry: PendingSync, delay: Duration, now: DateTime<Utc>) {
        entry.attempts += 1;
        entry.due_at = now + delay;
        if let Some(existing) = self.pending.get_mut(&entry.record_id) {
            existing.due_at = existing.due_at.max(entry.due_at);
        }
        self.restore(entry);
    }

    /// Put an entry back unchanged, e.g. when processing had to stop early.
    pub fn restore(&mut self, entry: PendingSync) {
        match self.pending.get_mut(&entry.record_id) {
            Some(existing) => {
                existing.reasons.extend(entry.reasons);
                existing.changed_fields.extend(entry.changed_fields);
                existing.first_triggered_at = existing.first_triggered_at.min(entry.first_triggered_at);
                existing.attempts = existing.attempts.max(entry.attempts);
            }
            None => {
                self.pending.insert(entry.record_id, entry);
            }
        }
    }

    /// Remove and return up to `limit` entries due at `now`, earliest first.
    pub fn drain_due(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<PendingSync> {
        let mut due: Vec<(DateTime<Utc>, RecordId)> = self
            .pending
            .values()
            .filter(|p| p.due_at <= now)
            .map(|p| (p.due_at, p.record_id))
            .collect();
        due.sort();
        due.truncate(limit);

        due.into_iter()
            .filter_map(|(_, id)| self.pending.remove(&id))
            .collect()
    }

    pub fn get(&self, record_id: RecordId) -> Option<&PendingSync> {
        self.pending.get(&record_id)
    }

    pub fn remove(&mut self, record_id: RecordId) -> Option<PendingSync> {
        self.pending.remove(&record_id)
    }

    /// All entries, earliest due first.
    pub fn entries(&self) -> Vec<&PendingSync> {
        let mut entries: Vec<_> = self.pending.values().collect();
        entries.sort_by_key(|p| (p.due_at, p.record_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest due time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|p| p.due_at).min()
    }

    /// Time until the next entry is due, zero if one already is.
    pub fn time_until_next_batch(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_due().map(|t| if t > now { t - now } else { Duration::zero() })
    }

    /// Persist queue to disk.
    pub fn persist(&self) -> Result<(), std::io::Error> {
        let Some(path) = &self.queue_file else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(&self.pending)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load queue from disk, replacing in-memory entries.
    pub fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(path) = &self.queue_file else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        self.pending = serde_json::from_str(&content)?;
        tracing::debug!(pending = self.pending.len(), path = %path.display(), "loaded sync queue");
        Ok(())
    }
}
