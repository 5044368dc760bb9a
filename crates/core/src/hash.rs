//! Canonical payload hashing for job deduplication.
//!
//! Two submissions are "the same work" when they share a file id and a
//! canonical content hash. Canonicalization sorts object keys recursively
//! and emits compact JSON, so key order and whitespace never affect the
//! hash. Array order is preserved: `[1,2]` and `[2,1]` are different
//! payloads.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: object keys sorted recursively,
/// compact encoding, no newlines.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Compute the hex-encoded SHA-256 of a payload's canonical form.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
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
                // Keys are encoded through serde_json for correct escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single compact rendering.
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn array_order_matters() {
        let a = json!({"items": [1, 2]});
        let b = json!({"items": [2, 1]});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn canonical_form_is_compact() {
        let v = json!({"b": [1, 2], "a": "x"});
        assert_eq!(canonical_json(&v), r#"{"a":"x","b":[1,2]}"#);
        assert!(!canonical_json(&v).contains('\n'));
    }

    #[test]
    fn keys_are_escaped() {
        let v = json!({"quo\"te": 1});
        assert_eq!(canonical_json(&v), r#"{"quo\"te":1}"#);
    }

    #[test]
    fn hash_is_hex_sha256() {
        let v = json!({});
        let h = content_hash(&v);
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
