//! Document validation and default application against a collection schema.

use serde::Serialize;
use serde_json::{Map, Value};

use super::types::{CollectionSchema, LeafNode, Properties, PropertyNode, PropertyType};
use crate::document::{format_date, now_value, parse_date, Document};
use crate::ids::DocId;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub missing: Vec<String>,
    pub invalid: Vec<String>,
}

impl ValidationReport {
    fn finish(mut self) -> Self {
        self.is_valid = self.missing.is_empty() && self.invalid.is_empty();
        self
    }

    /// Human summary used in error messages.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing field(s): {}", self.missing.join(", ")));
        }
        if !self.invalid.is_empty() {
            parts.push(format!("invalid field(s): {}", self.invalid.join(", ")));
        }
        parts.join("; ")
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// True when `value` is acceptable for `kind`. Null is always acceptable;
/// requiredness is checked separately.
pub fn type_matches(kind: PropertyType, value: &Value) -> bool {
    match (kind, value) {
        (_, Value::Null) => true,
        (PropertyType::String, Value::String(_)) => true,
        (PropertyType::Number, Value::Number(_)) => true,
        (PropertyType::Boolean, Value::Bool(_)) => true,
        (PropertyType::Date, Value::String(s)) => s == "now" || parse_date(s).is_some(),
        (PropertyType::Id, Value::String(s)) => s == "new" || DocId::parse(s).is_ok(),
        (PropertyType::Array, Value::Array(_)) => true,
        _ => false,
    }
}

fn check_leaf(leaf: &LeafNode, value: Option<&Value>, path: String, report: &mut ValidationReport) {
    let value = match value {
        None | Some(Value::Null) => {
            if leaf.required && leaf.default.is_none() {
                report.missing.push(path);
            }
            return;
        }
        Some(v) => v,
    };

    if !type_matches(leaf.kind, value) {
        report.invalid.push(path);
        return;
    }
    if let Some(allowed) = &leaf.enum_values {
        if !allowed.contains(value) {
            report.invalid.push(path);
            return;
        }
    }
    if let (Some(item_type), Value::Array(items)) = (leaf.item_type, value) {
        if items.iter().any(|i| i.is_null() || !type_matches(item_type, i)) {
            report.invalid.push(path);
        }
    }
}

fn check_properties(props: &Properties, body: Option<&Map<String, Value>>, prefix: &str, report: &mut ValidationReport) {
    for (name, node) in props.iter() {
        let path = join(prefix, name);
        let value = body.and_then(|b| b.get(name));
        match node {
            PropertyNode::Leaf(leaf) | PropertyNode::ArrayOfScalars(leaf) => {
                check_leaf(leaf, value, path, report)
            }
            PropertyNode::ArrayOfObjects(leaf, schema) => {
                check_leaf(leaf, value, path.clone(), report);
                if let Some(Value::Array(items)) = value {
                    for (i, item) in items.iter().enumerate() {
                        let item_path = format!("{}.{}", path, i);
                        match item {
                            Value::Object(map) => check_properties(schema, Some(map), &item_path, report),
                            _ => report.invalid.push(item_path),
                        }
                    }
                }
            }
            PropertyNode::Object(children) => match value {
                None | Some(Value::Null) => check_properties(children, None, &path, report),
                Some(Value::Object(map)) => check_properties(children, Some(map), &path, report),
                Some(_) => report.invalid.push(path),
            },
        }
    }
}

fn validate_one(schema: &CollectionSchema, body: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    match body {
        Value::Object(map) => check_properties(&schema.properties, Some(map), "", &mut report),
        _ => report.invalid.push(String::new()),
    }
    report.finish()
}

/// Validate a single document or a batch; for a batch the first failing
/// item's report is returned.
pub fn validate(schema: &CollectionSchema, body: &Value) -> ValidationReport {
    match body {
        Value::Array(items) => items
            .iter()
            .map(|item| validate_one(schema, item))
            .find(|r| !r.is_valid)
            .unwrap_or_else(|| ValidationReport::default().finish()),
        other => validate_one(schema, other),
    }
}

fn resolve_default(leaf: &LeafNode) -> Option<Value> {
    match (leaf.kind, leaf.default.as_ref()?) {
        (PropertyType::Id, Value::String(s)) if s == "new" => Some(DocId::new().to_value()),
        (PropertyType::Date, Value::String(s)) if s == "now" => Some(now_value()),
        (_, default) => Some(default.clone()),
    }
}

fn normalise(kind: PropertyType, value: &Value) -> Value {
    match (kind, value) {
        (PropertyType::Date, Value::String(s)) if s == "now" => now_value(),
        (PropertyType::Date, Value::String(s)) => match parse_date(s) {
            Some(date) => Value::String(format_date(&date)),
            None => value.clone(),
        },
        (PropertyType::Id, Value::String(s)) if s == "new" => DocId::new().to_value(),
        _ => value.clone(),
    }
}

fn apply_leaf(leaf: &LeafNode, value: Option<&Value>) -> Option<Value> {
    match value {
        Some(v) if !v.is_null() => Some(match (leaf.item_type, v) {
            (Some(item_type), Value::Array(items)) => {
                Value::Array(items.iter().map(|i| normalise(item_type, i)).collect())
            }
            _ => normalise(leaf.kind, v),
        }),
        Some(Value::Null) if leaf.default.is_none() => Some(Value::Null),
        _ => resolve_default(leaf).or_else(|| {
            (leaf.kind == PropertyType::Array).then(|| Value::Array(Vec::new()))
        }),
    }
}

fn apply_to(props: &Properties, body: Option<&Map<String, Value>>) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, node) in props.iter() {
        let value = body.and_then(|b| b.get(name));
        let applied = match node {
            PropertyNode::Leaf(leaf) | PropertyNode::ArrayOfScalars(leaf) => apply_leaf(leaf, value),
            PropertyNode::ArrayOfObjects(leaf, schema) => match value {
                Some(Value::Array(items)) => Some(Value::Array(
                    items
                        .iter()
                        .map(|item| Value::Object(apply_to(schema, item.as_object())))
                        .collect(),
                )),
                _ => apply_leaf(leaf, value),
            },
            PropertyNode::Object(children) => Some(Value::Object(apply_to(children, value.and_then(Value::as_object)))),
        };
        if let Some(v) = applied {
            out.insert(name.clone(), v);
        }
    }
    out
}

/// Keep only declared properties, fill defaults and normalise dates.
pub fn apply_properties(schema: &CollectionSchema, body: &Value) -> Document {
    apply_to(&schema.properties, body.as_object())
}

/// Same as [`apply_properties`] for a bare property tree, e.g. the element
/// schema of an array of objects.
pub fn apply_nested_properties(props: &Properties, body: &Value) -> Document {
    apply_to(props, body.as_object())
}
