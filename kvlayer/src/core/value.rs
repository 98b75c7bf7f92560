//! Value isolation and nested path helpers
//!
//! Values cross the public API as any `Serialize`/`DeserializeOwned` type and
//! live inside the buffer as owned [`serde_json::Value`] trees. Converting in
//! both directions is a deep copy: the caller never holds a reference into the
//! buffer and the buffer never holds a reference into caller memory.

use super::error::{KvError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Deep-copy a caller value into an owned tree
///
/// Fails with [`KvError::UnsupportedValue`] for values that have no JSON
/// representation (for example maps keyed by non-strings).
pub fn isolate<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| KvError::UnsupportedValue(e.to_string()))
}

/// Deep-copy an owned tree back into a caller type
pub fn materialize<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| KvError::TypeMismatch {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Navigate to the value addressed by `path`
///
/// Returns `None` when any segment is missing or crosses a scalar.
pub fn get_path<'a>(base: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = base;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    if current.is_null() { None } else { Some(current) }
}

/// Return `base` with the value at `path` replaced
///
/// Missing or null intermediate containers are created as objects. `None`
/// removes the addressed property. An empty path replaces the whole value.
pub fn set_path(base: Option<Value>, path: &[&str], value: Option<Value>) -> Result<Option<Value>> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(value);
    };

    let mut root = match base {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v,
    };

    let mut current = &mut root;
    for segment in parents {
        current = match current {
            Value::Object(map) => {
                let child = map.entry(segment.to_string()).or_insert(Value::Null);
                if child.is_null() {
                    *child = Value::Object(Map::new());
                }
                child
            }
            Value::Array(items) => {
                let index = parse_index(segment)?;
                let len = items.len();
                let child = items.get_mut(index).ok_or_else(|| {
                    KvError::InvalidPath(format!("index {} out of bounds (len {})", index, len))
                })?;
                if child.is_null() {
                    *child = Value::Object(Map::new());
                }
                child
            }
            other => return Err(non_container(segment, other)),
        };
    }

    match current {
        Value::Object(map) => match value {
            Some(v) => {
                map.insert(last.to_string(), v);
            }
            None => {
                map.remove(*last);
            }
        },
        Value::Array(items) => {
            let index = parse_index(last)?;
            match (index.cmp(&items.len()), value) {
                (std::cmp::Ordering::Less, v) => items[index] = v.unwrap_or(Value::Null),
                (std::cmp::Ordering::Equal, Some(v)) => items.push(v),
                (_, _) => {
                    return Err(KvError::InvalidPath(format!(
                        "index {} out of bounds (len {})",
                        index,
                        items.len()
                    )));
                }
            }
        }
        other => return Err(non_container(last, other)),
    }

    Ok(Some(root))
}

fn parse_index(segment: &str) -> Result<usize> {
    segment
        .parse::<usize>()
        .map_err(|_| KvError::InvalidPath(format!("'{}' is not an array index", segment)))
}

fn non_container(segment: &str, value: &Value) -> KvError {
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    KvError::InvalidPath(format!("cannot set property '{}' on a {}", segment, kind))
}
