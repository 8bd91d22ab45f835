//! Deterministic canonical JSON.
//!
//! The signed bytes of a JobSpec must not depend on how the sender serialized
//! it: key order, whitespace, and whether a zero-valued field was written or
//! omitted all vary between clients. Canonicalization therefore:
//!
//! 1. lifts the JSON into a [`CanonicalValue`] tree whose objects are key-sorted,
//! 2. drops the mutable top-level keys (see [`EXCLUDED_TOP_LEVEL_KEYS`]),
//! 3. prunes null, `""`, `[]`, `{}` and numeric zero object members, bottom-up,
//! 4. writes the tree with sorted keys and no whitespace.
//!
//! Pruning applies to object members only. Array elements keep their position
//! (their own contents are still pruned), because dropping an element would
//! change the meaning of the array.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use crate::model::JobSpec;

/// Top-level keys that never take part in the signed content.
pub const EXCLUDED_TOP_LEVEL_KEYS: [&str; 4] = ["id", "created_at", "signature", "public_key"];

/// Tagged-union JSON tree with statically sorted objects.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<CanonicalValue>),
    Object(BTreeMap<String, CanonicalValue>),
}

impl From<&Value> for CanonicalValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from).collect()),
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl CanonicalValue {
    /// Whether this value is one a sender may legitimately omit.
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(_) => false,
            Self::Number(n) => is_zero_number(n),
            Self::String(s) => s.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Object(map) => map.is_empty(),
        }
    }

    /// Recursively prune zero-valued object members.
    ///
    /// Children are pruned first, so an object that only held zero values
    /// becomes `{}` and is then dropped by its parent.
    pub fn pruned(self) -> Self {
        match self {
            Self::Array(items) => Self::Array(items.into_iter().map(Self::pruned).collect()),
            Self::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.pruned()))
                    .filter(|(_, v)| !v.is_zero())
                    .collect(),
            ),
            other => other,
        }
    }

    /// Remove the given keys if this is an object; no-op otherwise.
    pub fn without_keys(mut self, keys: &[&str]) -> Self {
        if let Self::Object(map) = &mut self {
            for key in keys {
                map.remove(*key);
            }
        }
        self
    }

    /// Serialize with sorted keys and no whitespace.
    pub fn to_canonical_string(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Number(n) => out.push_str(&n.to_string()),
            Self::String(s) => write_json_string(s, out),
            Self::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_into(out);
                }
                out.push(']');
            }
            Self::Object(map) => {
                out.push('{');
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_json_string(key, out);
                    out.push(':');
                    value.write_into(out);
                }
                out.push('}');
            }
        }
    }
}

fn is_zero_number(n: &Number) -> bool {
    if let Some(i) = n.as_i64() {
        return i == 0;
    }
    if let Some(u) = n.as_u64() {
        return u == 0;
    }
    n.as_f64().is_some_and(|f| f == 0.0)
}

fn write_json_string(s: &str, out: &mut String) {
    // serde_json's string escaping is the standard JSON encoding; it cannot fail for &str.
    match serde_json::to_string(s) {
        Ok(encoded) => out.push_str(&encoded),
        Err(_) => out.push_str("\"\""),
    }
}

/// Canonicalize any JSON value (prune + sort; no keys are excluded).
pub fn canonicalize_value(value: &Value) -> String {
    CanonicalValue::from(value).pruned().to_canonical_string()
}

/// Canonical signing input for a JobSpec.
pub fn canonicalize_job_spec(spec: &JobSpec) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(spec)?;
    Ok(CanonicalValue::from(&value)
        .without_keys(&EXCLUDED_TOP_LEVEL_KEYS)
        .pruned()
        .to_canonical_string())
}
