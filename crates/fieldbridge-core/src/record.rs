//! Content records and the sources they are read from.
//!
//! The pipeline only ever sees a record through [`Record::get_field`]; how the
//! host stores posts and custom fields is the source's business.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SourceError;

/// Local record identifier. Also the external id of the remote object.
pub type RecordId = u64;

/// Field-level read access to a content record.
pub trait Record {
    fn id(&self) -> RecordId;

    fn record_type(&self) -> &str;

    /// Publication/approval state, e.g. `publish` or `draft`.
    fn status(&self) -> &str;

    /// Current value of a custom field, `None` when the field does not exist.
    fn get_field(&self, key: &str) -> Option<Value>;
}

/// A record as exported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: RecordId,
    #[serde(default = "default_record_type")]
    pub record_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

fn default_record_type() -> String {
    "post".to_string()
}

impl ContentRecord {
    pub fn new(id: RecordId, record_type: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            status: status.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

impl Record for ContentRecord {
    fn id(&self) -> RecordId {
        self.id
    }

    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn status(&self) -> &str {
        &self.status
    }

    fn get_field(&self, key: &str) -> Option<Value> {
        self.fields.get(key).cloned()
    }
}

/// Whether a raw field value counts as empty.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Where the orchestrator and migrations fetch records from.
pub trait RecordSource {
    fn fetch(&self, record_id: RecordId) -> Result<Option<ContentRecord>, SourceError>;

    /// Records of `record_type` with id greater than `after`, ascending by id.
    fn list_after(
        &self,
        record_type: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<ContentRecord>, SourceError>;
}

/// Records held in memory, sorted by id.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    records: BTreeMap<RecordId, ContentRecord>,
}

impl InMemorySource {
    pub fn new(records: impl IntoIterator<Item = ContentRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn insert(&mut self, record: ContentRecord) {
        self.records.insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for InMemorySource {
    fn fetch(&self, record_id: RecordId) -> Result<Option<ContentRecord>, SourceError> {
        Ok(self.records.get(&record_id).cloned())
    }

    fn list_after(
        &self,
        record_type: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<ContentRecord>, SourceError> {
        let lower = after.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Excluded);
        Ok(self
            .records
            .range((lower, std::ops::Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| r.record_type == record_type)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records read from a JSON export: an array of [`ContentRecord`] objects.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    inner: InMemorySource,
}

impl JsonFileSource {
    /// Load the export at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a record array.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|e| SourceError::ReadFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let records: Vec<ContentRecord> =
            serde_json::from_str(&content).map_err(|e| SourceError::ReadFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            path,
            inner: InMemorySource::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for JsonFileSource {
    fn fetch(&self, record_id: RecordId) -> Result<Option<ContentRecord>, SourceError> {
        self.inner.fetch(record_id)
    }

    fn list_after(
        &self,
        record_type: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<ContentRecord>, SourceError> {
        self.inner.list_after(record_type, after, limit)
    }
}
