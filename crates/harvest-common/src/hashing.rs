//! Canonical JSON and content hashing
//!
//! Result rows are hashed over their semantic fields so that re-scraping the
//! same item produces the same hash regardless of field order or of volatile
//! metadata such as fetch timestamps.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields that never contribute to a content hash unless explicitly selected.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] =
    &["scraped_at", "fetched_at", "run_id", "created_at", "updated_at"];

/// Serialize a JSON value with object keys sorted at every depth and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(*key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Project a row onto the fields that take part in hashing.
///
/// With `keys`, only those top-level fields are kept (volatile rules do not
/// apply to an explicit selection). Without, every top-level field except the
/// `volatile` ones is kept. Non-object rows are returned unchanged.
pub fn semantic_projection(row: &Value, keys: Option<&[&str]>, volatile: &[&str]) -> Value {
    let Value::Object(map) = row else {
        return row.clone();
    };

    let projected = match keys {
        Some(keys) => map
            .iter()
            .filter(|(k, _)| keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => map
            .iter()
            .filter(|(k, _)| !volatile.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };

    Value::Object(projected)
}

/// SHA-256 (lowercase hex) of the canonical form of a row's semantic fields.
pub fn content_hash(row: &Value, keys: Option<&[&str]>, volatile: &[&str]) -> String {
    let canonical = canonical_json(&semantic_projection(row, keys, volatile));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
