//! Record-level shape validation and in-batch deduplication.

use std::collections::BTreeMap;

use serde_json::Value;
use vmhub_pipeline_models::{EnrichedRecord, SchemaField};

use crate::schema::check_field;

/// Lists everything wrong with `record` for the given schema.
///
/// An empty result means the record loads. Fields the schema does not
/// name are ignored.
#[must_use]
pub fn validate_record(schema: &[SchemaField], identifier_field: &str, record: &Value) -> Vec<String> {
    let Value::Object(fields) = record else {
        return vec!["record is not a JSON object".to_string()];
    };

    let mut violations = Vec::new();
    let identifier_missing = identifier_key(record, identifier_field).is_none();
    if identifier_missing {
        violations.push(format!("{identifier_field}: identifier is missing"));
    }

    for field in schema {
        if identifier_missing && field.name == identifier_field {
            continue;
        }
        check_field(field, fields.get(&field.name), "", &mut violations);
    }

    violations
}

/// Canonical text of a record's identifier, so `1` and `"1"` collide.
#[must_use]
pub fn identifier_key(record: &Value, identifier_field: &str) -> Option<String> {
    match record.get(identifier_field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keeps the last record per identifier, in order of first appearance.
///
/// Records without an identifier are dropped; callers validate first.
/// Returns the surviving records and how many were collapsed.
#[must_use]
pub fn dedup_last_wins(
    records: Vec<EnrichedRecord>,
    identifier_field: &str,
) -> (Vec<EnrichedRecord>, u64) {
    let total = records.len();
    let mut slots: BTreeMap<String, usize> = BTreeMap::new();
    let mut deduped: Vec<EnrichedRecord> = Vec::with_capacity(total);

    for record in records {
        let Some(key) = identifier_key(&record.record, identifier_field) else {
            continue;
        };
        if let Some(&slot) = slots.get(&key) {
            deduped[slot] = record;
        } else {
            slots.insert(key, deduped.len());
            deduped.push(record);
        }
    }

    let collapsed = u64::try_from(total - deduped.len()).unwrap_or(0);
    if collapsed > 0 {
        log::info!(
            "Deduplicated batch: {total} -> {} rows ({collapsed} duplicates removed)",
            deduped.len(),
        );
    }

    (deduped, collapsed)
}
