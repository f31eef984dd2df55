//! # Fieldbridge Core Library
//!
//! One-way sync bridge from CMS content records to CRM objects. The CLI is a
//! thin layer over the same library.
//!
//! ## Architecture
//!
//! - **Mapping**: layered field mapping registry (defaults, saved, overrides)
//! - **Transform**: payload builder with per-field strategies and derived fields
//! - **Validator**: eligibility gate composed with extension checks
//! - **Remote**: OAuth token lifecycle and the CRM upsert client
//! - **Sync**: debounce queue and the per-record orchestrator
//! - **Migration**: resumable full-corpus backfill
//! - **Storage**: SQLite state store and TOML configuration
//!
//! ## Key Components
//!
//! - [`SyncOrchestrator`]: drives records through validate, transform, upsert
//! - [`MappingRegistry`]: resolves the active mappings per record type
//! - [`CrmClient`]: HTTP client with token refresh and retries
//! - [`Config`]: application configuration management

pub mod audit;
pub mod error;
pub mod hooks;
pub mod mapping;
pub mod migration;
pub mod record;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod transform;
pub mod validator;

pub use audit::{AuditCategory, AuditEntry, AuditFilter, AuditLevel, AuditTrail};
pub use error::{
    ApiError, ApiErrorKind, AuthError, ConfigError, CoreError, DatabaseError, SourceError,
    TransformError, ValidationError,
};
pub use hooks::Hooks;
pub use mapping::{DerivedField, FieldMapping, MappingRegistry, MappingSnapshot, Strategy};
pub use migration::{MigrationOptions, MigrationRun, MigrationState, MigrationSummary};
pub use record::{ContentRecord, InMemorySource, JsonFileSource, Record, RecordId, RecordSource};
pub use remote::{ConnectionReport, CrmApi, CrmClient, InMemoryCrm, UpsertResult};
pub use storage::{Config, MemoryStore, SqliteStore, StateStore};
pub use sync::{
    Disposition, SyncEvent, SyncOrchestrator, SyncOutcome, SyncQueue, SyncReport, SyncStatus,
    TriggerReason,
};
pub use transform::{build_payload, SyncPayload};
pub use validator::{Eligibility, Validator};
