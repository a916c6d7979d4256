//! Dotted-path access over JSON documents.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// A stored document: a JSON object keyed by field name, `_id` included.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Canonical storage form of a timestamp.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_value() -> Value {
    Value::String(format_date(&Utc::now()))
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// Collect every value reachable along `path`, traversing arrays implicitly.
///
/// Numeric segments index into arrays. An empty path yields the value itself.
pub fn values_at<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    if path.is_empty() {
        out.push(value);
        return out;
    }
    let segments: Vec<&str> = path.split('.').collect();
    collect(value, &segments, &mut out);
    out
}

fn collect<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect(child, rest, out);
                }
            } else {
                for item in items {
                    collect(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Single-valued lookup, no implicit array traversal.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn container_mut<'a>(doc: &'a mut Value, segments: &[&str], path: &str) -> Result<&'a mut Value> {
    let mut current = doc;
    for segment in segments {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let index = segment.parse::<usize>().map_err(|_| invalid_target(path))?;
                items.get_mut(index).ok_or_else(|| invalid_target(path))?
            }
            _ => return Err(invalid_target(path)),
        };
    }
    Ok(current)
}

fn invalid_target(path: &str) -> DbError {
    DbError::validation("invalid_path", format!("Invalid update target: {}", path))
}

/// Replace the value at `path`, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| invalid_target(path))?;
    let parent = container_mut(doc, parents, path)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = last.parse::<usize>().map_err(|_| invalid_target(path))?;
            let slot = items.get_mut(index).ok_or_else(|| invalid_target(path))?;
            *slot = value;
            Ok(())
        }
        _ => Err(invalid_target(path)),
    }
}

/// Append to the array at `path`; a missing or null field becomes a new array.
pub fn push_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let target = container_mut(doc, &segments, path)?;
    let fresh = match target {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if fresh {
        *target = Value::Array(vec![value]);
        return Ok(());
    }
    match target {
        Value::Array(items) => {
            items.push(value);
            Ok(())
        }
        _ => Err(invalid_target(path)),
    }
}

/// Remove element `index` of the array at `path`, keeping sibling order.
pub fn remove_at_path(doc: &mut Value, path: &str, index: usize) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let target = container_mut(doc, &segments, path)?;
    match target {
        Value::Array(items) if index < items.len() => {
            items.remove(index);
            Ok(())
        }
        _ => Err(invalid_target(path)),
    }
}

/// Keep only the listed paths (plus `_id`).
pub fn project_include(doc: &Document, paths: &[String]) -> Document {
    let source = Value::Object(doc.clone());
    let mut out = Value::Object(Map::new());
    if let Some(id) = doc.get(ID_FIELD) {
        let _ = set_path(&mut out, ID_FIELD, id.clone());
    }
    for path in paths {
        if let Some(value) = get_path(&source, path) {
            let _ = set_path(&mut out, path, value.clone());
        }
    }
    match out {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn remove_path(value: &mut Value, segments: &[&str]) {
    match segments {
        [] => {}
        [last] => {
            if let Value::Object(map) = value {
                map.remove(*last);
            }
        }
        [head, rest @ ..] => {
            if let Some(child) = value.get_mut(*head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Drop the listed paths.
pub fn project_exclude(doc: &Document, paths: &[String]) -> Document {
    let mut value = Value::Object(doc.clone());
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        remove_path(&mut value, &segments);
    }
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
