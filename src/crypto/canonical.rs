//! Canonical JSON encoding and the hashes derived from it
//!
//! The canonical form of a JSON value has object keys sorted by their
//! UTF-8 bytes, no insignificant whitespace and the minimal separators
//! `,` and `:`. Hashes of JSON documents are SHA-512 over the canonical
//! bytes followed by a single NUL byte.

use crate::types::{HashCode, Salt};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};

/// Encode `value` canonically
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
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
        // Scalars already have a single compact rendering
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-512 of arbitrary bytes
pub fn sha512(data: &[u8]) -> HashCode {
    let digest = Sha512::digest(data);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&digest);
    HashCode::from_bytes(bytes)
}

/// SHA-512 of the canonical encoding plus a trailing NUL
pub fn hash_json(value: &Value) -> HashCode {
    let mut hasher = Sha512::new();
    hasher.update(canonical_json(value).as_bytes());
    hasher.update([0u8]);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&hasher.finalize());
    HashCode::from_bytes(bytes)
}

/// `h_contract_terms` of a contract document
pub fn hash_contract_terms(contract_terms: &Value) -> HashCode {
    hash_json(contract_terms)
}

/// `h_wire` of a bank account: the hash of `{payto_uri, salt}`
pub fn hash_wire(payto_uri: &str, salt: &Salt) -> HashCode {
    hash_json(&wire_descriptor(payto_uri, salt))
}

/// Account descriptor given to wallets and exchanges
pub fn wire_descriptor(payto_uri: &str, salt: &Salt) -> Value {
    json!({
        "payto_uri": payto_uri,
        "salt": salt,
    })
}

/// Hash of a wire method name, NUL included
pub fn hash_wire_method(wire_method: &str) -> HashCode {
    let mut data = Vec::with_capacity(wire_method.len() + 1);
    data.extend_from_slice(wire_method.as_bytes());
    data.push(0);
    sha512(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sorted_keys(json!({"b": 1, "a": 2}), r#"{"a":2,"b":1}"#)]
    #[case::nested(json!({"z": {"y": [1, {"b": true, "a": null}]}}), r#"{"z":{"y":[1,{"a":null,"b":true}]}}"#)]
    #[case::escapes(json!({"k": "line\n\"quoted\""}), r#"{"k":"line\n\"quoted\""}"#)]
    #[case::unicode(json!({"ü": "ß"}), "{\"ü\":\"ß\"}")]
    #[case::empty(json!({}), "{}")]
    fn test_canonical_json(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(canonical_json(&value), expected);
    }

    #[test]
    fn test_hash_ignores_key_order_and_whitespace() {
        let a: Value = serde_json::from_str(r#"{"amount":"EUR:5","order_id":"O1","products":[]}"#)
            .unwrap();
        let b: Value = serde_json::from_str(
            "{ \"products\" : [ ],\n \"order_id\": \"O1\", \"amount\": \"EUR:5\" }",
        )
        .unwrap();
        assert_eq!(hash_contract_terms(&a), hash_contract_terms(&b));
    }

    #[test]
    fn test_reencoding_canonical_form_is_stable() {
        let value = json!({"c": [3, 2, 1], "a": {"y": "x", "b": 1.5}});
        let once = canonical_json(&value);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_json(&reparsed), once);
    }

    #[test]
    fn test_hash_includes_trailing_nul() {
        let value = json!({"a": 1});
        let without_nul = sha512(canonical_json(&value).as_bytes());
        assert_ne!(hash_json(&value), without_nul);
        assert_eq!(hash_json(&value), sha512(b"{\"a\":1}\0"));
    }

    #[test]
    fn test_hash_wire_depends_on_salt() {
        let uri = "payto://iban/DE89370400440532013000";
        let s1 = Salt::from_bytes([1u8; 32]);
        let s2 = Salt::from_bytes([2u8; 32]);
        assert_eq!(hash_wire(uri, &s1), hash_wire(uri, &s1));
        assert_ne!(hash_wire(uri, &s1), hash_wire(uri, &s2));
    }
}
