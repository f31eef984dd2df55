//! Builds the remote payload for a record.
//!
//! Order of operations:
//! 1. each mapped field is read, dropped if absent or empty, and run through its strategy
//! 2. derived fields are computed from their numeric sources
//! 3. payload post-processors run in registration order
//! 4. metadata fields are written last and overwrite anything already there

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use serde_json::{Map, Number, Value};

use crate::error::TransformError;
use crate::hooks::Hooks;
use crate::mapping::{DerivedOp, FieldMapping, MappingSnapshot, Strategy};
use crate::record::{is_empty_value, Record};
use crate::storage::SyncSettings;

/// Remote field → value, in mapping order. Never persisted.
pub type SyncPayload = Map<String, Value>;

/// A fixed field added to every payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadMetadata {
    pub field: String,
    pub value: Value,
}

impl PayloadMetadata {
    /// The source-platform tag configured in `[sync]`.
    pub fn platform(settings: &SyncSettings) -> Self {
        Self {
            field: settings.platform_field.clone(),
            value: Value::String(settings.platform_tag.clone()),
        }
    }
}

/// Build the payload for `record` from a mapping snapshot.
///
/// # Errors
/// Returns an error only for malformed mappings: an empty remote field or a
/// strategy parameter that cannot be interpreted.
pub fn build_payload(
    record: &dyn Record,
    snapshot: &MappingSnapshot,
    hooks: &Hooks,
    metadata: &[PayloadMetadata],
) -> Result<SyncPayload, TransformError> {
    let mut payload = SyncPayload::new();

    for mapping in &snapshot.mappings {
        if mapping.remote_field.trim().is_empty() {
            return Err(TransformError::EmptyRemoteField(mapping.local_key.clone()));
        }
        let raw = record.get_field(&mapping.local_key);
        if let Some(value) = apply_strategy(mapping, raw)? {
            payload.insert(mapping.remote_field.clone(), value);
        }
    }

    for derived in &snapshot.derived {
        let [left, right] = &derived.sources;
        let operands = record
            .get_field(left)
            .as_ref()
            .and_then(as_number)
            .zip(record.get_field(right).as_ref().and_then(as_number));
        let Some((a, b)) = operands else {
            tracing::trace!(record_id = record.id(), field = %derived.remote_field, "derived field skipped");
            continue;
        };
        let result = match derived.operation {
            DerivedOp::Product => a * b,
        };
        if let Some(n) = Number::from_f64(result) {
            payload.insert(derived.remote_field.clone(), Value::Number(n));
        }
    }

    let mut payload = hooks.apply_post_processors(payload, record.id());

    for meta in metadata {
        payload.insert(meta.field.clone(), meta.value.clone());
    }

    Ok(payload)
}

/// Transform one raw field value. `Ok(None)` means the field is omitted.
///
/// # Errors
/// Returns an error when a strategy parameter is malformed.
pub fn apply_strategy(
    mapping: &FieldMapping,
    raw: Option<Value>,
) -> Result<Option<Value>, TransformError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    if mapping.strategy == Strategy::Boolean {
        return Ok(Some(Value::Bool(coerce_boolean(&raw))));
    }
    if is_empty_value(&raw) {
        return Ok(None);
    }

    let value = match mapping.strategy {
        Strategy::None | Strategy::Boolean => raw,
        Strategy::CommaSeparated => join_values(raw, ","),
        Strategy::CustomDelimiter => {
            let delimiter = mapping.param("delimiter").filter(|d| !d.is_empty()).unwrap_or(",");
            join_values(raw, delimiter)
        }
        Strategy::Numeric => {
            let precision = precision_param(mapping)?;
            match as_number(&raw) {
                Some(n) => {
                    let n = match precision {
                        Some(digits) => round_to(n, digits),
                        None => n,
                    };
                    Number::from_f64(n).map(Value::Number).unwrap_or(raw)
                }
                None => raw,
            }
        }
        Strategy::Date => {
            let format = format_param(mapping)?;
            match raw.as_str().and_then(|s| reformat_date(s, format)) {
                Some(formatted) => Value::String(formatted),
                None => raw,
            }
        }
    };
    Ok(Some(value))
}

/// `"1"`, `1` and `true` are true; everything else, including empty values, is false.
pub fn coerce_boolean(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => s == "1",
        _ => false,
    }
}

/// Numbers, and strings that parse as a finite number after trimming.
pub fn is_numeric(value: &Value) -> bool {
    as_number(value).is_some()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn round_to(n: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (n * factor).round() / factor
}

fn precision_param(mapping: &FieldMapping) -> Result<Option<u32>, TransformError> {
    mapping
        .param("precision")
        .map(|p| {
            p.trim().parse::<u32>().map_err(|e| TransformError::MalformedMapping {
                local_key: mapping.local_key.clone(),
                param: "precision".into(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn format_param(mapping: &FieldMapping) -> Result<Option<&str>, TransformError> {
    match mapping.param("format") {
        Some(format) if StrftimeItems::new(format).any(|i| matches!(i, Item::Error)) || format.is_empty() => {
            Err(TransformError::MalformedMapping {
                local_key: mapping.local_key.clone(),
                param: "format".into(),
                message: format!("'{format}' is not a valid date format"),
            })
        }
        other => Ok(other),
    }
}

fn join_values(raw: Value, delimiter: &str) -> Value {
    match raw {
        Value::Array(items) => Value::String(
            items
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(delimiter),
        ),
        other => other,
    }
}

/// Reformat an 8-digit `YYYYMMDD` string.
///
/// Without a format the digits are sliced into `YYYY-MM-DD`. With a format
/// the string must also be a real calendar date. Returns `None` when the
/// value should pass through unchanged.
pub fn reformat_date(raw: &str, format: Option<&str>) -> Option<String> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match format {
        None => Some(format!("{}-{}-{}", &raw[0..4], &raw[4..6], &raw[6..8])),
        Some(format) => NaiveDate::parse_from_str(raw, "%Y%m%d")
            .ok()
            .map(|date| date.format(format).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DerivedField;
    use crate::record::ContentRecord;
    use crate::mapping::Strategy;
    use proptest::prelude::*;
    use serde_json::json;

    fn post_snapshot() -> MappingSnapshot {
        MappingSnapshot {
            record_type: "post".into(),
            mappings: crate::mapping::default_post_mappings(),
            derived: vec![DerivedField::product(
                "Total_Weight__c",
                "quantity",
                "average_weight_per_load",
            )],
        }
    }

    fn meta() -> Vec<PayloadMetadata> {
        vec![PayloadMetadata {
            field: "Source_Platform__c".into(),
            value: json!("cms"),
        }]
    }

    fn strategy(strategy: Strategy) -> FieldMapping {
        FieldMapping::new("field", "Field__c").with_strategy(strategy)
    }

    #[test]
    fn boolean_coercion_table() {
        let m = strategy(Strategy::Boolean);
        for (input, expected) in [
            (json!("1"), true),
            (json!(1), true),
            (json!(true), true),
            (json!("0"), false),
            (json!(""), false),
            (json!(null), false),
            (json!(false), false),
            (json!(0), false),
            (json!("yes"), false),
        ] {
            assert_eq!(
                apply_strategy(&m, Some(input.clone())).unwrap(),
                Some(Value::Bool(expected)),
                "input {input}"
            );
        }
        assert_eq!(apply_strategy(&m, None).unwrap(), None);
    }

    #[test]
    fn comma_and_custom_delimiter() {
        let comma = strategy(Strategy::CommaSeparated);
        assert_eq!(
            apply_strategy(&comma, Some(json!(["a", "b", "c"]))).unwrap(),
            Some(json!("a,b,c"))
        );
        assert_eq!(apply_strategy(&comma, Some(json!([]))).unwrap(), None);

        let pipe = strategy(Strategy::CustomDelimiter).with_param("delimiter", " | ");
        assert_eq!(
            apply_strategy(&pipe, Some(json!(["x", 2]))).unwrap(),
            Some(json!("x | 2"))
        );

        let missing = strategy(Strategy::CustomDelimiter).with_param("delimiter", "");
        assert_eq!(
            apply_strategy(&missing, Some(json!(["x", "y"]))).unwrap(),
            Some(json!("x,y"))
        );
    }

    #[test]
    fn numeric_and_precision() {
        let m = strategy(Strategy::Numeric);
        assert_eq!(apply_strategy(&m, Some(json!(" 12 "))).unwrap(), Some(json!(12.0)));
        assert_eq!(apply_strategy(&m, Some(json!("n/a"))).unwrap(), Some(json!("n/a")));
        assert_eq!(apply_strategy(&m, Some(json!(""))).unwrap(), None);

        let rounded = strategy(Strategy::Numeric).with_param("precision", "2");
        assert_eq!(
            apply_strategy(&rounded, Some(json!("1.23456"))).unwrap(),
            Some(json!(1.23))
        );

        let bad = strategy(Strategy::Numeric).with_param("precision", "two");
        assert!(matches!(
            apply_strategy(&bad, Some(json!(1))),
            Err(TransformError::MalformedMapping { ref param, .. }) if param == "precision"
        ));
    }

    #[test]
    fn date_strategy() {
        let m = strategy(Strategy::Date);
        assert_eq!(
            apply_strategy(&m, Some(json!("20240115"))).unwrap(),
            Some(json!("2024-01-15"))
        );
        assert_eq!(
            apply_strategy(&m, Some(json!("2024-01-15"))).unwrap(),
            Some(json!("2024-01-15"))
        );

        let custom = strategy(Strategy::Date).with_param("format", "%d/%m/%Y");
        assert_eq!(
            apply_strategy(&custom, Some(json!("20240115"))).unwrap(),
            Some(json!("15/01/2024"))
        );
        assert_eq!(
            apply_strategy(&custom, Some(json!("20241345"))).unwrap(),
            Some(json!("20241345"))
        );

        let bad = strategy(Strategy::Date).with_param("format", "%Q");
        assert!(apply_strategy(&bad, Some(json!("20240115"))).is_err());
    }

    #[test]
    fn full_payload_for_listing() {
        let record = ContentRecord::new(12, "post", "publish")
            .with_field("post_title", "Gravel lot")
            .with_field("quantity", "10")
            .with_field("average_weight_per_load", 5.5)
            .with_field("available_date", "20240301")
            .with_field("is_featured", "1")
            .with_field("tags", json!(["a", "b", "c"]));

        let payload = build_payload(&record, &post_snapshot(), &Hooks::new(), &meta()).unwrap();
        assert_eq!(payload["Name"], "Gravel lot");
        assert_eq!(payload["Quantity__c"], json!(10.0));
        assert_eq!(payload["Available_Date__c"], "2024-03-01");
        assert_eq!(payload["Featured__c"], true);
        assert_eq!(payload["Tags__c"], "a,b,c");
        assert_eq!(payload["Total_Weight__c"], json!(55.0));
        assert_eq!(payload["Source_Platform__c"], "cms");

        let keys: Vec<_> = payload.keys().map(String::as_str).collect();
        assert_eq!(keys.first(), Some(&"Name"));
        assert_eq!(keys.last(), Some(&"Source_Platform__c"));
    }

    #[test]
    fn missing_optional_and_derived_source_are_absent() {
        let record = ContentRecord::new(3, "post", "publish")
            .with_field("post_title", "Sand")
            .with_field("quantity", 4);

        let payload = build_payload(&record, &post_snapshot(), &Hooks::new(), &meta()).unwrap();
        assert!(!payload.contains_key("Average_Weight_Per_Load__c"));
        assert!(!payload.contains_key("Total_Weight__c"));
        assert!(!payload.contains_key("Featured__c"));
        assert!(!payload.contains_key("Available_Date__c"));
    }

    #[test]
    fn metadata_overwrites_post_processor_output() {
        let mut hooks = Hooks::new();
        hooks.register_payload_post_processor("tag", |mut p, _| {
            p.insert("Source_Platform__c".into(), json!("spoofed"));
            p.insert("Extra__c".into(), json!(1));
            p
        });
        let record = ContentRecord::new(3, "post", "publish").with_field("post_title", "Sand");
        let payload = build_payload(&record, &post_snapshot(), &hooks, &meta()).unwrap();
        assert_eq!(payload["Source_Platform__c"], "cms");
        assert_eq!(payload["Extra__c"], 1);
    }

    #[test]
    fn empty_remote_field_is_rejected() {
        let snapshot = MappingSnapshot {
            record_type: "post".into(),
            mappings: vec![FieldMapping::new("post_title", "")],
            derived: Vec::new(),
        };
        let record = ContentRecord::new(1, "post", "publish").with_field("post_title", "x");
        assert_eq!(
            build_payload(&record, &snapshot, &Hooks::new(), &[]),
            Err(TransformError::EmptyRemoteField("post_title".into()))
        );
    }

    proptest! {
        #[test]
        fn eight_digit_strings_are_dashed(digits in "[0-9]{8}") {
            let out = reformat_date(&digits, None).unwrap();
            prop_assert_eq!(out.len(), 10);
            prop_assert_eq!(out.replace('-', ""), digits.clone());
            prop_assert_eq!(&out[4..5], "-");
            prop_assert_eq!(&out[7..8], "-");
        }

        #[test]
        fn other_strings_pass_through(raw in "\\PC*") {
            prop_assume!(!(raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit())));
            prop_assert!(reformat_date(&raw, None).is_none());
            let m = FieldMapping::new("d", "D__c").with_strategy(Strategy::Date);
            if !is_empty_value(&json!(raw.clone())) {
                prop_assert_eq!(apply_strategy(&m, Some(json!(raw.clone()))).unwrap(), Some(json!(raw)));
            }
        }

        #[test]
        fn only_one_string_is_truthy(raw in "\\PC*") {
            prop_assert_eq!(coerce_boolean(&json!(raw.clone())), raw == "1");
        }
    }
}
