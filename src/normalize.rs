//! Schema key normalization
//!
//! Schemas written or generated outside this crate may arrive as YAML, where
//! mapping keys can be numbers, booleans, null or tagged values. The schema
//! model only understands string keys, so everything is folded into a
//! `serde_json::Value` first.

use serde_json::{Map, Number, Value};
use serde_yaml::Value as YamlValue;

/// Convert a YAML tree into an equivalent JSON tree with plain string keys.
///
/// Array order, mapping order and scalar values are preserved. Tags are
/// dropped in favour of the tagged value.
pub fn normalize_keys(value: &YamlValue) -> Value {
    match value {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(*b),
        YamlValue::Number(n) => yaml_number(n),
        YamlValue::String(s) => Value::String(s.clone()),
        YamlValue::Sequence(items) => Value::Array(items.iter().map(normalize_keys).collect()),
        YamlValue::Mapping(mapping) => {
            let mut map = Map::with_capacity(mapping.len());
            for (key, val) in mapping {
                map.insert(key_to_string(key), normalize_keys(val));
            }
            Value::Object(map)
        }
        YamlValue::Tagged(tagged) => normalize_keys(&tagged.value),
    }
}

fn key_to_string(key: &YamlValue) -> String {
    match key {
        YamlValue::String(s) => s.clone(),
        YamlValue::Null => String::new(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Tagged(tagged) => key_to_string(&tagged.value),
        // Composite keys: use their JSON rendering
        YamlValue::Sequence(_) | YamlValue::Mapping(_) => normalize_keys(key).to_string(),
    }
}

fn yaml_number(n: &serde_yaml::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Number(i.into())
    } else if let Some(u) = n.as_u64() {
        Value::Number(u.into())
    } else {
        // NaN and infinities have no JSON form
        n.as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
