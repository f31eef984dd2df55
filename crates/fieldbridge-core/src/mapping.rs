//! Field mapping registry.
//!
//! Resolves, per record type, which local field feeds which remote field and
//! how its value is transformed. Three layers are merged in order:
//!
//! 1. built-in defaults
//! 2. administrator-saved mappings (state store, `mappings:<record_type>`)
//! 3. runtime overrides registered by extensions
//!
//! The last writer wins per `local_key`. A replaced mapping keeps the position
//! of its first occurrence, so payload field order is stable across layers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, DatabaseError, ValidationError};
use crate::storage::{load_json, save_json, StateStore};

/// Value transformation applied to a mapped field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    None,
    Boolean,
    CommaSeparated,
    CustomDelimiter,
    Numeric,
    Date,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::None => "none",
            Strategy::Boolean => "boolean",
            Strategy::CommaSeparated => "comma_separated",
            Strategy::CustomDelimiter => "custom_delimiter",
            Strategy::Numeric => "numeric",
            Strategy::Date => "date",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Strategy::None),
            "boolean" | "bool" => Ok(Strategy::Boolean),
            "comma_separated" | "comma" => Ok(Strategy::CommaSeparated),
            "custom_delimiter" | "delimiter" => Ok(Strategy::CustomDelimiter),
            "numeric" | "number" => Ok(Strategy::Numeric),
            "date" => Ok(Strategy::Date),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One local field → remote field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub local_key: String,
    pub remote_field: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strategy_params: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new(local_key: impl Into<String>, remote_field: impl Into<String>) -> Self {
        Self {
            local_key: local_key.into(),
            remote_field: remote_field.into(),
            strategy: Strategy::None,
            strategy_params: BTreeMap::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.strategy_params.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.strategy_params.get(name).map(String::as_str)
    }
}

/// Arithmetic used to compute a derived field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedOp {
    Product,
}

/// A remote field computed from two local fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedField {
    pub remote_field: String,
    pub operation: DerivedOp,
    pub sources: [String; 2],
}

impl DerivedField {
    pub fn product(
        remote_field: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> Self {
        Self {
            remote_field: remote_field.into(),
            operation: DerivedOp::Product,
            sources: [left.into(), right.into()],
        }
    }
}

/// Immutable view of the resolved mappings for one record type, taken at
/// sync time so that later registrations cannot affect an in-flight payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingSnapshot {
    pub record_type: String,
    pub mappings: Vec<FieldMapping>,
    pub derived: Vec<DerivedField>,
}

impl MappingSnapshot {
    /// Local keys that influence the payload.
    pub fn source_keys(&self) -> BTreeSet<String> {
        self.mappings
            .iter()
            .map(|m| m.local_key.clone())
            .chain(self.derived.iter().flat_map(|d| d.sources.iter().cloned()))
            .collect()
    }
}

/// Built-in mappings for the `post` record type.
pub fn default_post_mappings() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new("post_title", "Name"),
        FieldMapping::new("quantity", "Quantity__c").with_strategy(Strategy::Numeric),
        FieldMapping::new("average_weight_per_load", "Average_Weight_Per_Load__c")
            .with_strategy(Strategy::Numeric),
        FieldMapping::new("available_date", "Available_Date__c").with_strategy(Strategy::Date),
        FieldMapping::new("is_featured", "Featured__c").with_strategy(Strategy::Boolean),
        FieldMapping::new("tags", "Tags__c").with_strategy(Strategy::CommaSeparated),
    ]
}

fn saved_key(record_type: &str) -> String {
    format!("mappings:{record_type}")
}

fn merge_layer(resolved: &mut Vec<FieldMapping>, layer: &[FieldMapping]) {
    for mapping in layer {
        match resolved.iter_mut().find(|m| m.local_key == mapping.local_key) {
            Some(existing) => *existing = mapping.clone(),
            None => resolved.push(mapping.clone()),
        }
    }
}

/// Layered registry of field mappings.
pub struct MappingRegistry {
    store: Arc<dyn StateStore>,
    defaults: BTreeMap<String, Vec<FieldMapping>>,
    derived: BTreeMap<String, Vec<DerivedField>>,
    overrides: BTreeMap<String, Vec<FieldMapping>>,
}

impl MappingRegistry {
    /// Registry with the built-in `post` defaults.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let mut registry = Self::empty(store);
        registry.set_defaults("post", default_post_mappings());
        registry.register_derived_field(
            "post",
            DerivedField::product("Total_Weight__c", "quantity", "average_weight_per_load"),
        );
        registry
    }

    /// Registry without built-in defaults.
    pub fn empty(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            defaults: BTreeMap::new(),
            derived: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn set_defaults(&mut self, record_type: &str, mappings: Vec<FieldMapping>) {
        self.defaults.insert(record_type.to_string(), mappings);
    }

    pub fn register_derived_field(&mut self, record_type: &str, field: DerivedField) {
        let fields = self.derived.entry(record_type.to_string()).or_default();
        fields.retain(|f| f.remote_field != field.remote_field);
        fields.push(field);
    }

    /// Register a runtime override. Applied after saved mappings; last wins.
    pub fn register_field_mapping_override(&mut self, record_type: &str, mapping: FieldMapping) {
        tracing::debug!(
            record_type,
            local_key = %mapping.local_key,
            remote_field = %mapping.remote_field,
            "registered field mapping override"
        );
        self.overrides
            .entry(record_type.to_string())
            .or_default()
            .push(mapping);
    }

    /// Administrator-saved mappings for a record type.
    pub fn saved_mappings(&self, record_type: &str) -> Result<Vec<FieldMapping>, DatabaseError> {
        Ok(load_json::<Vec<FieldMapping>>(self.store.as_ref(), &saved_key(record_type))?
            .unwrap_or_default())
    }

    /// Replace the saved layer for a record type.
    ///
    /// # Errors
    /// Rejects empty keys or remote fields and duplicate local keys.
    pub fn save_mappings(
        &self,
        record_type: &str,
        mappings: &[FieldMapping],
    ) -> Result<(), CoreError> {
        let mut seen = BTreeSet::new();
        for mapping in mappings {
            if mapping.local_key.trim().is_empty() {
                return Err(ValidationError::Empty("local_key".into()).into());
            }
            if mapping.remote_field.trim().is_empty() {
                return Err(ValidationError::Empty(format!(
                    "remote_field for '{}'",
                    mapping.local_key
                ))
                .into());
            }
            if !seen.insert(mapping.local_key.as_str()) {
                return Err(ValidationError::DuplicateKey(mapping.local_key.clone()).into());
            }
        }
        save_json(self.store.as_ref(), &saved_key(record_type), &mappings)?;
        Ok(())
    }

    /// Add or replace one saved mapping.
    pub fn set_saved_mapping(&self, record_type: &str, mapping: FieldMapping) -> Result<(), CoreError> {
        let mut saved = self.saved_mappings(record_type)?;
        merge_layer(&mut saved, std::slice::from_ref(&mapping));
        self.save_mappings(record_type, &saved)
    }

    /// Remove one saved mapping. Returns whether it existed.
    pub fn remove_saved_mapping(&self, record_type: &str, local_key: &str) -> Result<bool, CoreError> {
        let mut saved = self.saved_mappings(record_type)?;
        let before = saved.len();
        saved.retain(|m| m.local_key != local_key);
        if saved.len() == before {
            return Ok(false);
        }
        self.save_mappings(record_type, &saved)?;
        Ok(true)
    }

    /// Merge all layers for a record type.
    pub fn resolve_mappings(&self, record_type: &str) -> Result<Vec<FieldMapping>, DatabaseError> {
        let mut resolved = Vec::new();
        if let Some(defaults) = self.defaults.get(record_type) {
            merge_layer(&mut resolved, defaults);
        }
        merge_layer(&mut resolved, &self.saved_mappings(record_type)?);
        if let Some(overrides) = self.overrides.get(record_type) {
            merge_layer(&mut resolved, overrides);
        }
        Ok(resolved)
    }

    pub fn derived_fields(&self, record_type: &str) -> Vec<DerivedField> {
        self.derived.get(record_type).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self, record_type: &str) -> Result<MappingSnapshot, DatabaseError> {
        Ok(MappingSnapshot {
            record_type: record_type.to_string(),
            mappings: self.resolve_mappings(record_type)?,
            derived: self.derived_fields(record_type),
        })
    }
}
