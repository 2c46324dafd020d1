//! Text normalization for exact matching
//!
//! Record key values and entity identifiers are compared after:
//! - Trimming surrounding whitespace
//! - Unicode lowercase folding
//!
//! Nothing else is stripped: `"AT&T"` and `"AT T"` are different keys.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::types::Entity;

/// Normalize one value for lexical comparison.
///
/// ```
/// use entity_resolver::normalize::normalize_key;
///
/// assert_eq!(normalize_key("  Ada Lovelace "), "ada lovelace");
/// assert_eq!(normalize_key("Q7259"), "q7259");
/// ```
pub fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Render a record key value as text.
///
/// `null` has no text. Strings are taken verbatim, numbers and booleans use
/// their JSON spelling, nested values their compact JSON.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Normalized, non-empty values of the given fields of a record.
pub fn record_key_values(keys: &Map<String, Value>, fields: &[String]) -> HashSet<String> {
    fields
        .iter()
        .filter_map(|field| keys.get(field))
        .filter_map(key_text)
        .map(|text| normalize_key(&text))
        .filter(|text| !text.is_empty())
        .collect()
}

/// Normalized, non-empty display name and external identifier values of an
/// entity.
pub fn entity_key_values(entity: &Entity) -> HashSet<String> {
    std::iter::once(entity.display_name.as_str())
        .chain(entity.external_ids.values().map(String::as_str))
        .map(normalize_key)
        .filter(|text| !text.is_empty())
        .collect()
}

/// Space-joined text of the given fields, skipping null and empty values.
///
/// Whitespace-only results collapse to the empty string, which callers treat
/// as "nothing to embed".
pub fn semantic_text(keys: &Map<String, Value>, fields: &[String]) -> String {
    let parts: Vec<String> = fields
        .iter()
        .filter_map(|field| keys.get(field))
        .filter_map(key_text)
        .filter(|text| !text.is_empty())
        .collect();

    let joined = parts.join(" ");
    if joined.trim().is_empty() {
        String::new()
    } else {
        joined
    }
}

/// Scalar key values of a record, used as the external identifiers of an
/// entity created from it. Nested values are not identifiers and are skipped.
pub fn scalar_external_ids(keys: &Map<String, Value>) -> BTreeMap<String, String> {
    keys.iter()
        .filter(|(_, v)| !matches!(v, Value::Array(_) | Value::Object(_)))
        .filter_map(|(k, v)| key_text(v).map(|text| (k.clone(), text)))
        .filter(|(_, text)| !text.trim().is_empty())
        .collect()
}
