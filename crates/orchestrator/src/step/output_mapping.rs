use cryton_core::OutputMapping;
use serde_json::{Map, Value};

/// Renames top-level keys of a serialized output. All renamed values are
/// taken out before any is inserted, so the result does not depend on key
/// order.
pub fn apply(mappings: &[OutputMapping], output: Value) -> Value {
    let Value::Object(mut map) = output else {
        return output;
    };
    if mappings.is_empty() {
        return Value::Object(map);
    }

    let moved: Vec<(&str, Value)> = mappings
        .iter()
        .filter_map(|m| map.remove(&m.name_from).map(|v| (m.name_to.as_str(), v)))
        .collect();
    let mut renamed = Map::new();
    for (name, value) in moved {
        renamed.insert(name.to_string(), value);
    }
    map.extend(renamed);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(from: &str, to: &str) -> OutputMapping {
        OutputMapping {
            name_from: from.to_string(),
            name_to: to.to_string(),
        }
    }

    #[test]
    fn test_rename_keys() {
        let output = json!({"username": "u", "password": "p", "port": 22});
        let mapped = apply(&[mapping("username", "user"), mapping("missing", "x")], output);
        assert_eq!(mapped, json!({"user": "u", "password": "p", "port": 22}));
    }

    #[test]
    fn test_independent_of_key_order() {
        let mappings = [mapping("a", "b"), mapping("b", "c")];
        let first: Value = serde_json::from_str(r#"{"a": 1, "b": 2, "z": 0}"#).unwrap();
        let second: Value = serde_json::from_str(r#"{"z": 0, "b": 2, "a": 1}"#).unwrap();
        let expected = json!({"b": 1, "c": 2, "z": 0});
        assert_eq!(apply(&mappings, first), expected);
        assert_eq!(apply(&mappings, second), expected);
    }

    #[test]
    fn test_non_object_is_untouched() {
        assert_eq!(apply(&[mapping("a", "b")], json!([1, 2])), json!([1, 2]));
    }
}
