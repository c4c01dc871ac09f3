//! Deterministic JSON canonicalization.
//!
//! Event hashes commit to the exact byte rendering of their payload, so the
//! rendering must be stable across processes and releases: object keys
//! sorted lexicographically at every depth, minimal whitespace, only the
//! escapes JSON mandates, `null` values retained.

use serde::Serialize;
use serde_json::Value;

use crate::error::LedgerError;

/// Render a JSON value in canonical form.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonical UTF-8 bytes, the exact input of event hashing.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_string(value).into_bytes()
}

/// Serialize any value through `serde_json` and canonicalize the result.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, LedgerError> {
    let v = serde_json::to_value(value)
        .map_err(|e| LedgerError::Internal(format!("canonicalization failed: {e}")))?;
    Ok(canonical_string(&v))
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json's own rendering keeps integers exact and is stable for
        // a given float bit pattern
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_value(out, &map[key]);
            }
            out.push('}');
        }
    }
}

// Only the escapes required by RFC 8259: quote, backslash, and control
// characters below 0x20. Everything else passes through as UTF-8.
fn write_escaped(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_at_every_depth() {
        let v = json!({
            "b": 1,
            "a": { "z": null, "m": [ {"k": 2, "c": 3} ] },
        });
        assert_eq!(
            canonical_string(&v),
            r#"{"a":{"m":[{"c":3,"k":2}],"z":null},"b":1}"#
        );
    }

    #[test]
    fn null_fields_retained() {
        let v = json!({ "reason": null, "amount": 5 });
        assert_eq!(canonical_string(&v), r#"{"amount":5,"reason":null}"#);
    }

    #[test]
    fn escapes_are_minimal() {
        let v = json!({ "s": "a\"b\\c\nd\u{1}é" });
        assert_eq!(canonical_string(&v), "{\"s\":\"a\\\"b\\\\c\\nd\\u0001é\"}");
    }

    #[test]
    fn idempotent_over_reparse() {
        let v = json!({
            "amount": 100000,
            "currency": "USD",
            "meta": { "tags": ["x", "y"], "note": "café", "n": -3 },
        });
        let once = canonical_string(&v);
        let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_string(&reparsed), once);
    }

    #[test]
    fn integers_render_exact() {
        let v = json!({ "max": 100_000_000_000u64, "neg": -42 });
        assert_eq!(canonical_string(&v), r#"{"max":100000000000,"neg":-42}"#);
    }
}
