//! BLAKE3 fingerprints of attribute sets.
//!
//! Fingerprints back drift comparison: the state record stores the hash of
//! the attributes the provider confirmed, and a fresh `read` is hashed the
//! same way. Canonical form is key-sorted, NUL-joined.

use crate::core::types::AttrValue;
use indexmap::IndexMap;

/// Hash an arbitrary string, `blake3:`-prefixed.
pub fn hash_string(input: &str) -> String {
    format!("blake3:{}", blake3::hash(input.as_bytes()).to_hex())
}

/// Fingerprint an attribute set. Key order does not affect the result.
pub fn fingerprint_attrs(attrs: &IndexMap<String, AttrValue>) -> String {
    let mut keys: Vec<&String> = attrs.keys().collect();
    keys.sort();

    let mut canonical = String::new();
    for key in keys {
        canonical.push_str(key);
        canonical.push('\0');
        write_canonical(&attrs[key], &mut canonical);
        canonical.push('\0');
    }
    hash_string(&canonical)
}

fn write_canonical(value: &AttrValue, out: &mut String) {
    match value {
        AttrValue::Null => out.push_str("~"),
        AttrValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        AttrValue::Int(i) => out.push_str(&i.to_string()),
        AttrValue::Float(f) => out.push_str(&f.to_string()),
        AttrValue::Str(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        AttrValue::List(items) => {
            out.push('[');
            for item in items {
                write_canonical(item, out);
                out.push(',');
            }
            out.push(']');
        }
        AttrValue::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for key in keys {
                out.push_str(key);
                out.push(':');
                write_canonical(&map[key], out);
                out.push(',');
            }
            out.push('}');
        }
        AttrValue::Ref(r) => out.push_str(&r.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string_prefixed_and_stable() {
        let h1 = hash_string("hello");
        let h2 = hash_string("hello");
        assert_eq!(h1, h2);
        assert!(h1.starts_with("blake3:"));
        assert_ne!(hash_string("hello"), hash_string("world"));
    }

    #[test]
    fn test_fingerprint_key_order_independent() {
        let a = IndexMap::from([
            ("name".to_string(), AttrValue::Str("api".to_string())),
            ("cpu".to_string(), AttrValue::Int(256)),
        ]);
        let b = IndexMap::from([
            ("cpu".to_string(), AttrValue::Int(256)),
            ("name".to_string(), AttrValue::Str("api".to_string())),
        ]);
        assert_eq!(fingerprint_attrs(&a), fingerprint_attrs(&b));
    }

    #[test]
    fn test_fingerprint_value_sensitive() {
        let a = IndexMap::from([("name".to_string(), AttrValue::Str("api".to_string()))]);
        let b = IndexMap::from([("name".to_string(), AttrValue::Str("api2".to_string()))]);
        assert_ne!(fingerprint_attrs(&a), fingerprint_attrs(&b));
    }

    #[test]
    fn test_fingerprint_sequence_ordered() {
        let a = IndexMap::from([(
            "cmd".to_string(),
            AttrValue::List(vec![
                AttrValue::Str("serve".to_string()),
                AttrValue::Str("--port".to_string()),
            ]),
        )]);
        let b = IndexMap::from([(
            "cmd".to_string(),
            AttrValue::List(vec![
                AttrValue::Str("--port".to_string()),
                AttrValue::Str("serve".to_string()),
            ]),
        )]);
        assert_ne!(fingerprint_attrs(&a), fingerprint_attrs(&b));
    }

    #[test]
    fn test_fingerprint_string_vs_int_distinct() {
        let a = IndexMap::from([("v".to_string(), AttrValue::Str("1".to_string()))]);
        let b = IndexMap::from([("v".to_string(), AttrValue::Int(1))]);
        assert_ne!(fingerprint_attrs(&a), fingerprint_attrs(&b));
    }
}
