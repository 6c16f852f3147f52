//! Canonical JSON serialization and content addressing.
//!
//! Hashes recorded in traces must be reproducible across runs and across
//! implementations, so values are serialized with Unicode-sorted object keys
//! and no insignificant whitespace before hashing.

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically: object keys sorted, compact form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hex SHA-256 over the canonical JSON form of `value`.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Encode raw bytes for embedding in a canonical JSON document.
pub fn encode_binary(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => {
            // serde_json applies standard JSON string escaping.
            let _ = write!(out, "{}", Value::String(s.clone()));
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String((*key).clone()));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_level() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[3,2],"z":true},"b":1}"#);
    }

    #[test]
    fn hash_is_insensitive_to_key_order() {
        let left = json!({"x": 1, "y": "two"});
        let right = json!({"y": "two", "x": 1});
        assert_eq!(content_hash(&left), content_hash(&right));
    }

    #[test]
    fn hash_is_sensitive_to_values() {
        assert_ne!(
            content_hash(&json!({"x": 1})),
            content_hash(&json!({"x": 2}))
        );
    }

    #[test]
    fn binary_payloads_embed_as_base64() {
        let encoded = encode_binary(b"\x00\x01binary");
        let value = json!({"blob": encoded});
        // The encoded form is plain JSON, so it hashes like any other value.
        assert_eq!(content_hash(&value), content_hash(&value.clone()));
        assert_eq!(encode_binary(b""), "");
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!({"msg": "line\nbreak \"quoted\""});
        let rendered = canonical_json(&value);
        assert_eq!(rendered, r#"{"msg":"line\nbreak \"quoted\""}"#);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, value);
    }
}
