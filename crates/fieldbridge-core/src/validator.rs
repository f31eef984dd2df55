//! Sync eligibility validator.
//!
//! Checks run as a short-circuit AND: publication status, then required
//! fields, then extension checks in registration order. Extension checks only
//! see records the built-in checks accepted, so they can narrow eligibility
//! but never widen it.

use std::collections::BTreeMap;
use std::fmt;

use crate::audit::{AuditCategory, AuditContext, AuditEntry, AuditLevel, AuditTrail};
use crate::hooks::Hooks;
use crate::record::{is_empty_value, Record};
use crate::storage::RecordTypeConfig;

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    UnknownRecordType(String),
    Status { status: String, allowed: Vec<String> },
    MissingField(String),
    ExtensionCheck(String),
}

impl IneligibleReason {
    /// Name of the failing check, for audit context.
    pub fn check(&self) -> &'static str {
        match self {
            IneligibleReason::UnknownRecordType(_) => "record_type",
            IneligibleReason::Status { .. } => "status",
            IneligibleReason::MissingField(_) => "required_field",
            IneligibleReason::ExtensionCheck(_) => "extension",
        }
    }
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::UnknownRecordType(t) => write!(f, "record type '{t}' is not configured"),
            IneligibleReason::Status { status, allowed } => write!(
                f,
                "status '{status}' is not one of [{}]",
                allowed.join(", ")
            ),
            IneligibleReason::MissingField(field) => write!(f, "required field '{field}' is empty"),
            IneligibleReason::ExtensionCheck(name) => write!(f, "rejected by eligibility check '{name}'"),
        }
    }
}

/// Result of an eligibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Gates records before they reach the transformer.
pub struct Validator {
    record_types: BTreeMap<String, RecordTypeConfig>,
    audit: AuditTrail,
}

impl Validator {
    pub fn new(record_types: BTreeMap<String, RecordTypeConfig>, audit: AuditTrail) -> Self {
        Self {
            record_types,
            audit,
        }
    }

    pub fn is_eligible(&self, record: &dyn Record, hooks: &Hooks) -> bool {
        self.check(record, hooks).is_eligible()
    }

    /// Run all checks. A rejection is written to the audit trail as a warning.
    pub fn check(&self, record: &dyn Record, hooks: &Hooks) -> Eligibility {
        self.check_with_context(record, hooks, AuditContext::new())
    }

    /// Like [`Validator::check`], with `context` (trigger, changed fields)
    /// merged into the rejection's audit entry.
    pub fn check_with_context(&self, record: &dyn Record, hooks: &Hooks, context: AuditContext) -> Eligibility {
        match self.first_failure(record, hooks) {
            None => Eligibility::Eligible,
            Some(reason) => {
                let mut entry = AuditEntry::new(
                    AuditLevel::Warning,
                    AuditCategory::Validation,
                    format!("Record {} is not eligible for sync: {reason}", record.id()),
                )
                .for_record(record.id())
                .with_context(context)
                .with("check", reason.check())
                .with("record_type", record.record_type())
                .with("status", record.status());
                match &reason {
                    IneligibleReason::MissingField(field) => entry = entry.with("field", field.as_str()),
                    IneligibleReason::ExtensionCheck(name) => entry = entry.with("extension", name.as_str()),
                    _ => {}
                }
                self.audit.record(entry);
                Eligibility::Ineligible(reason)
            }
        }
    }

    fn first_failure(&self, record: &dyn Record, hooks: &Hooks) -> Option<IneligibleReason> {
        let Some(config) = self.record_types.get(record.record_type()) else {
            return Some(IneligibleReason::UnknownRecordType(record.record_type().to_string()));
        };

        if !config.publish_statuses.iter().any(|s| s == record.status()) {
            return Some(IneligibleReason::Status {
                status: record.status().to_string(),
                allowed: config.publish_statuses.clone(),
            });
        }

        if let Some(field) = config
            .required_fields
            .iter()
            .find(|f| record.get_field(f).map_or(true, |v| is_empty_value(&v)))
        {
            return Some(IneligibleReason::MissingField(field.clone()));
        }

        hooks
            .first_failing_check(record)
            .map(|name| IneligibleReason::ExtensionCheck(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::record::ContentRecord;
    use crate::storage::{Config, MemoryStore};
    use std::sync::Arc;

    fn validator() -> (Validator, AuditTrail) {
        let audit = AuditTrail::new(Arc::new(MemoryStore::new()));
        (Validator::new(Config::default().record_types, audit.clone()), audit)
    }

    fn published() -> ContentRecord {
        ContentRecord::new(10, "post", "publish").with_field("post_title", "Gravel")
    }

    #[test]
    fn published_record_with_title_is_eligible() {
        let (v, audit) = validator();
        assert!(v.is_eligible(&published(), &Hooks::new()));
        assert!(audit.recent(&AuditFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn draft_is_rejected_with_warning() {
        let (v, audit) = validator();
        let draft = ContentRecord::new(11, "post", "draft").with_field("post_title", "x");
        let result = v.check(&draft, &Hooks::new());
        assert!(matches!(
            result,
            Eligibility::Ineligible(IneligibleReason::Status { ref status, .. }) if status == "draft"
        ));

        let entries = audit.recent(&AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, AuditLevel::Warning);
        assert_eq!(entries[0].category, AuditCategory::Validation);
        assert_eq!(entries[0].record_id, Some(11));
        assert_eq!(entries[0].context["check"], "status");
    }

    #[test]
    fn rejection_carries_caller_context() {
        let (v, audit) = validator();
        let draft = ContentRecord::new(14, "post", "draft").with_field("post_title", "x");
        let mut context = AuditContext::new();
        context.insert("trigger".into(), "save".into());
        assert!(!v.check_with_context(&draft, &Hooks::new(), context).is_eligible());

        let entries = audit.recent(&AuditFilter::default()).unwrap();
        assert_eq!(entries[0].context["trigger"], "save");
        assert_eq!(entries[0].context["check"], "status");
    }

    #[test]
    fn empty_required_field_is_named() {
        let (v, audit) = validator();
        let record = ContentRecord::new(12, "post", "publish").with_field("post_title", "  ");
        assert_eq!(
            v.check(&record, &Hooks::new()),
            Eligibility::Ineligible(IneligibleReason::MissingField("post_title".into()))
        );
        let entries = audit.recent(&AuditFilter::default()).unwrap();
        assert_eq!(entries[0].context["field"], "post_title");
    }

    #[test]
    fn unknown_record_type_is_rejected() {
        let (v, _) = validator();
        let page = ContentRecord::new(1, "page", "publish");
        assert!(!v.is_eligible(&page, &Hooks::new()));
    }

    #[test]
    fn extension_checks_only_narrow() {
        let (v, _) = validator();
        let mut hooks = Hooks::new();
        hooks.register_eligibility_check("permissive", |_| true);

        let draft = ContentRecord::new(13, "post", "draft").with_field("post_title", "x");
        assert!(!v.is_eligible(&draft, &hooks));
        assert!(v.is_eligible(&published(), &hooks));

        hooks.register_eligibility_check("no_featured", |r| r.get_field("is_featured").is_none());
        assert!(v.is_eligible(&published(), &hooks));
        let featured = published().with_field("is_featured", "1");
        assert_eq!(
            v.check(&featured, &hooks),
            Eligibility::Ineligible(IneligibleReason::ExtensionCheck("no_featured".into()))
        );
    }
}
