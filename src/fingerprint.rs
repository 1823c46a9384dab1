//! Stable fingerprints for detected conditions.
//!
//! A fingerprint hashes only the identity of a condition: signal type,
//! business, the entity it is about, and the window boundaries. Volatile
//! numeric payload fields are excluded by construction so identity survives
//! small numeric jitter between runs, while a different vendor or window
//! yields a different fingerprint.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Canonical JSON: recursively sorted object keys, no whitespace. The output
/// is the hashing input, so it must be identical across runs and processes.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), canonicalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Identity window for a fingerprint; dates serialize as ISO-8601.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint over exactly {signal_type, business_id, entity, window}.
pub fn fingerprint(
    signal_type: &str,
    business_id: &str,
    entity: &str,
    window: Option<FingerprintWindow>,
) -> String {
    let mut ident = Map::new();
    ident.insert("signal_type".to_string(), Value::String(signal_type.to_string()));
    ident.insert("business_id".to_string(), Value::String(business_id.to_string()));
    ident.insert("entity".to_string(), Value::String(entity.to_string()));
    let (start, end) = match window {
        Some(w) => (
            Value::String(w.start.format("%Y-%m-%d").to_string()),
            Value::String(w.end.format("%Y-%m-%d").to_string()),
        ),
        None => (Value::Null, Value::Null),
    };
    ident.insert("window_start".to_string(), start);
    ident.insert("window_end".to_string(), end);
    sha256_hex(&canonical_json(&Value::Object(ident)))
}

/// Stable signal id: `{signal_type}-{first 12 hex of fingerprint}`.
pub fn signal_id(signal_type: &str, fingerprint: &str) -> String {
    format!("{}-{}", signal_type, &fingerprint[..12.min(fingerprint.len())])
}
