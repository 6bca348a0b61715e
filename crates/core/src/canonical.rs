//! Canonicalization shared by the spec deduper (C1) and molecule store (C2).
//!
//! Two independently submitted documents that differ only in key order or in
//! `+0` vs `-0` must hash identically (§9 "Dynamic JSON keyword maps"). Key
//! sorting falls out for free: `serde_json::Map` is backed by a `BTreeMap`
//! here (the `preserve_order` cargo feature is deliberately not enabled), so
//! serializing a `Value` always emits object keys in sorted order.

use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively normalizes numeric values in place: negative zero collapses
/// to positive zero, and NaN/infinite values (which cannot survive a real
/// JSON parse, but could reach us via a float constructed in-process) are
/// rejected outright rather than silently coerced.
pub fn canonicalize_numbers(value: &mut Value) -> CoreResult<()> {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.is_nan() || f.is_infinite() {
                    return Err(CoreError::developer_error(
                        "NaN and infinite values are not permitted in specification or molecule content",
                    ));
                }
                if f == 0.0 && f.is_sign_negative() {
                    *n = serde_json::Number::from(0);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize_numbers(item)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                canonicalize_numbers(item)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::String(_) => {}
    }
    Ok(())
}

/// Canonicalizes `value` (key-sort is automatic; numeric normalization is
/// applied recursively) and returns its canonical JSON encoding.
pub fn canonical_json(mut value: Value) -> CoreResult<String> {
    canonicalize_numbers(&mut value)?;
    serde_json::to_string(&value).map_err(|err| {
        CoreError::developer_error(format!("failed to encode canonical JSON: {err}"))
    })
}

/// The content hash used for both specification and molecule identity: a
/// SHA-256 digest of the canonical JSON encoding, hex-encoded.
pub fn content_hash(value: Value) -> CoreResult<String> {
    let canon = canonical_json(value)?;
    let digest = Sha256::digest(canon.as_bytes());
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_the_hash() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(content_hash(a).unwrap(), content_hash(b).unwrap());
    }

    #[test]
    fn negative_zero_collapses_to_positive_zero() {
        let a = json!({"x": -0.0});
        let b = json!({"x": 0.0});
        assert_eq!(content_hash(a).unwrap(), content_hash(b).unwrap());
    }

    #[test]
    fn nested_objects_are_canonicalized_recursively() {
        let a = json!({"outer": {"z": -0.0, "a": 1}, "list": [{"y": 2, "x": 1}]});
        let b = json!({"list": [{"x": 1, "y": 2}], "outer": {"a": 1, "z": 0.0}});
        assert_eq!(content_hash(a).unwrap(), content_hash(b).unwrap());
    }

    #[test]
    fn distinct_content_hashes_differently() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(content_hash(a).unwrap(), content_hash(b).unwrap());
    }
}
