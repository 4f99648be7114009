//! Deterministic digests over canonicalized inputs.
//!
//! Fingerprints drive the idempotency lookup: two semantically identical
//! input sets must hash to the same digest regardless of map key ordering.
//! The same SHA-256 primitive also produces artifact content digests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// A hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-computed hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the digest as a hex string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened prefix for log output.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hashes raw bytes into a fingerprint.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Hashes a JSON value over its canonical encoding.
///
/// Canonicalization recursively sorts object keys, so two values that
/// differ only in key order produce identical fingerprints.
#[must_use]
pub fn fingerprint_value(value: &Value) -> Fingerprint {
    digest_bytes(canonical_json(value).as_bytes())
}

/// Produces the canonical encoding of a JSON value: compact, with object
/// keys recursively sorted.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let canonical = canonicalize(value);
    serde_json::to_string(&canonical).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // serde_json::Map preserves insertion order; rebuild sorted.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_bytes_deterministic() {
        let a = digest_bytes(b"hello");
        let b = digest_bytes(b"hello");
        let c = digest_bytes(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let first = json!({"b": 2, "a": 1, "nested": {"y": true, "x": false}});
        let second = json!({"a": 1, "nested": {"x": false, "y": true}, "b": 2});

        assert_eq!(fingerprint_value(&first), fingerprint_value(&second));
    }

    #[test]
    fn test_fingerprint_value_sensitive() {
        let first = json!({"a": 1});
        let second = json!({"a": 2});

        assert_ne!(fingerprint_value(&first), fingerprint_value(&second));
    }

    #[test]
    fn test_array_order_is_significant() {
        let first = json!([1, 2, 3]);
        let second = json!([3, 2, 1]);

        assert_ne!(fingerprint_value(&first), fingerprint_value(&second));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"z": 1, "a": {"c": 3, "b": 2}});
        assert_eq!(canonical_json(&value), r#"{"a":{"b":2,"c":3},"z":1}"#);
    }

    #[test]
    fn test_short_prefix() {
        let fp = digest_bytes(b"abc");
        assert_eq!(fp.short().len(), 12);
        assert!(fp.as_str().starts_with(fp.short()));
    }

    #[test]
    fn test_fingerprint_serde_transparent() {
        let fp = digest_bytes(b"abc");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.as_str()));

        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
