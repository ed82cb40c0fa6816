//! Column values and documents.
//!
//! Every dialect speaks `serde_json::Value` at the column level. A
//! [`Document`] is the JSON object form used by the document store and by
//! the key-value dialect's serialized entities.

use std::hash::{Hash, Hasher};

pub use serde_json::Value;

/// A JSON object with insertion-ordered fields.
pub type Document = serde_json::Map<String, Value>;

/// Separator between the segments of an embedded column path.
pub const PATH_SEPARATOR: char = '.';

/// Feeds a value into `state` consistently with `Value`'s equality.
///
/// Object fields are hashed in sorted key order because two objects with
/// the same fields in a different order compare equal.
pub fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(state);
                hash_value(&map[key.as_str()], state);
            }
        }
    }
}

/// Hashes a slice of values in order.
pub fn hash_values<H: Hasher>(values: &[Value], state: &mut H) {
    values.len().hash(state);
    for value in values {
        hash_value(value, state);
    }
}

/// Reads a dotted path (`address.city`) out of a document.
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split(PATH_SEPARATOR);
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes `value` at a dotted path, creating intermediate objects.
///
/// A non-object value sitting on an intermediate segment is replaced.
pub fn set_path(document: &mut Document, path: &str, value: Value) {
    match path.split_once(PATH_SEPARATOR) {
        None => {
            document.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() {
                *child = Value::Object(Document::new());
            }
            if let Value::Object(inner) = child {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Removes the value at a dotted path. Emptied intermediate objects are
/// removed as well. Returns the removed value, if any.
pub fn remove_path(document: &mut Document, path: &str) -> Option<Value> {
    match path.split_once(PATH_SEPARATOR) {
        None => document.shift_remove(path),
        Some((head, rest)) => {
            let removed = match document.get_mut(head) {
                Some(Value::Object(inner)) => remove_path(inner, rest),
                _ => None,
            };
            if matches!(document.get(head), Some(Value::Object(inner)) if inner.is_empty()) {
                document.shift_remove(head);
            }
            removed
        }
    }
}

/// Flattens nested objects into dotted column names. Arrays and scalars
/// are kept as leaf values.
pub fn flatten(document: &Document) -> Vec<(String, Value)> {
    let mut columns = Vec::new();
    flatten_into(document, None, &mut columns);
    columns
}

fn flatten_into(document: &Document, prefix: Option<&str>, out: &mut Vec<(String, Value)>) {
    for (field, value) in document {
        let column = match prefix {
            Some(p) => format!("{p}{PATH_SEPARATOR}{field}"),
            None => field.clone(),
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                flatten_into(inner, Some(&column), out);
            }
            _ => out.push((column, value.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn hash_of(value: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_value(value, &mut hasher);
        hasher.finish()
    }

    #[test]
    fn object_hash_ignores_field_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn set_and_get_nested_path() {
        let mut d = Document::new();
        set_path(&mut d, "address.city", json!("Paris"));
        set_path(&mut d, "address.zip", json!("75001"));
        assert_eq!(get_path(&d, "address.city"), Some(&json!("Paris")));
        assert_eq!(Value::Object(d), json!({"address": {"city": "Paris", "zip": "75001"}}));
    }

    #[test]
    fn remove_path_prunes_empty_parents() {
        let mut d = doc(json!({"name": "Ada", "address": {"city": "London"}}));
        assert_eq!(remove_path(&mut d, "address.city"), Some(json!("London")));
        assert_eq!(Value::Object(d), json!({"name": "Ada"}));
    }

    #[test]
    fn flatten_keeps_arrays_whole() {
        let d = doc(json!({"a": {"b": 1, "c": {"d": true}}, "tags": [1, 2]}));
        let flat = flatten(&d);
        assert_eq!(
            flat,
            vec![
                ("a.b".to_string(), json!(1)),
                ("a.c.d".to_string(), json!(true)),
                ("tags".to_string(), json!([1, 2])),
            ]
        );
    }
}
