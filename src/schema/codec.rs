//! Encoding of schema descriptions and expansion into collection schemas.

use serde_json::{Map, Value};
use tracing::warn;

use super::types::{
    CollectionSchema, LeafNode, Properties, PropertyNode, PropertyType, SchemaDescription,
    TIMESTAMPS,
};
use crate::error::{DbError, Result};

fn decode_error(path: &str, message: impl std::fmt::Display) -> DbError {
    if path.is_empty() {
        DbError::SchemaDecode(message.to_string())
    } else {
        DbError::SchemaDecode(format!("{}: {}", path, message))
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn bool_marker(map: &Map<String, Value>, key: &str, default: bool, path: &str) -> Result<bool> {
    match map.get(key) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(decode_error(path, format!("{} must be a boolean, got {}", key, other))),
    }
}

fn decode_leaf(map: &Map<String, Value>, path: &str) -> Result<PropertyNode> {
    let kind = match map.get("__type") {
        Some(Value::String(t)) => PropertyType::parse(t).map_err(|e| decode_error(path, e))?,
        _ => return Err(decode_error(path, "__type must be a string")),
    };

    for key in map.keys() {
        if !key.starts_with("__") {
            return Err(decode_error(
                path,
                format!("unexpected key '{}' next to __type", key),
            ));
        }
    }

    let item_type = match map.get("__itemtype") {
        None | Some(Value::Null) => None,
        Some(Value::String(t)) => Some(PropertyType::parse(t).map_err(|e| decode_error(path, e))?),
        Some(other) => return Err(decode_error(path, format!("invalid __itemtype {}", other))),
    };
    let enum_values = match map.get("__enum") {
        None => None,
        Some(Value::Array(values)) => Some(values.clone()),
        Some(other) => return Err(decode_error(path, format!("__enum must be an array, got {}", other))),
    };

    let leaf = LeafNode {
        kind,
        default: map.get("__default").cloned(),
        required: bool_marker(map, "__required", false, path)?,
        allow_update: bool_marker(map, "__allowUpdate", true, path)?,
        enum_values,
        item_type,
    };

    match (kind, map.get("__schema")) {
        (PropertyType::Array, Some(Value::Object(schema))) => {
            if leaf.item_type.is_some() {
                return Err(decode_error(path, "__itemtype and __schema are exclusive"));
            }
            Ok(PropertyNode::ArrayOfObjects(leaf, decode_properties(schema, path)?))
        }
        (_, Some(_)) => Err(decode_error(path, "__schema is only valid on array properties")),
        (PropertyType::Array, None) if leaf.item_type.is_some() => Ok(PropertyNode::ArrayOfScalars(leaf)),
        (_, None) if leaf.item_type.is_some() => {
            Err(decode_error(path, "__itemtype is only valid on array properties"))
        }
        (_, None) => Ok(PropertyNode::Leaf(leaf)),
    }
}

fn decode_node(value: &Value, path: &str) -> Result<PropertyNode> {
    let map = value
        .as_object()
        .ok_or_else(|| decode_error(path, format!("expected an object, got {}", value)))?;

    if map.contains_key("__type") {
        return decode_leaf(map, path);
    }
    if let Some(key) = map.keys().find(|k| k.starts_with("__")) {
        return Err(decode_error(path, format!("marker '{}' without __type", key)));
    }
    Ok(PropertyNode::Object(decode_properties(map, path)?))
}

fn decode_properties(map: &Map<String, Value>, prefix: &str) -> Result<Properties> {
    let mut props = Properties::new();
    for (name, value) in map {
        let path = join(prefix, name);
        props.insert(name.clone(), decode_node(value, &path)?);
    }
    Ok(props)
}

fn optional_string(map: &Map<String, Value>, key: &str, path: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(decode_error(path, format!("{} must be a string, got {}", key, other))),
    }
}

fn decode_description(value: &Value) -> Result<SchemaDescription> {
    let map = value
        .as_object()
        .ok_or_else(|| decode_error("", format!("schema entry must be an object, got {}", value)))?;

    let name = match map.get("name") {
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        _ => return Err(decode_error("", "schema entry is missing a name")),
    };

    let extends = match map.get("extends") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| {
                i.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| decode_error(&name, "extends must only hold strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(decode_error(&name, "extends must be an array")),
    };

    let properties = match map.get("properties") {
        None | Some(Value::Null) => Properties::new(),
        Some(Value::Object(props)) => decode_properties(props, &name)?,
        Some(_) => return Err(decode_error(&name, "properties must be an object")),
    };

    let roles = match map.get("roles") {
        None | Some(Value::Null) => None,
        Some(Value::Array(roles)) => Some(roles.clone()),
        Some(_) => return Err(decode_error(&name, "roles must be an array")),
    };

    let relationship = match optional_string(map, "$relationship", &name)? {
        Some(r) => Some(r),
        None => optional_string(map, "relationship", &name)?,
    };

    Ok(SchemaDescription {
        kind: optional_string(map, "type", &name)?,
        collection: optional_string(map, "collection", &name)?,
        remote: optional_string(map, "remote", &name)?,
        name,
        extends,
        properties,
        roles,
        relationship,
    })
}

/// Decode an encoded schema list (JSON array text).
pub fn decode(encoded: &str) -> Result<Vec<SchemaDescription>> {
    let value: Value = serde_json::from_str(encoded)
        .map_err(|e| DbError::SchemaDecode(format!("malformed schema: {}", e)))?;
    decode_value(&value)
}

pub fn decode_value(value: &Value) -> Result<Vec<SchemaDescription>> {
    match value {
        Value::Array(entries) => entries.iter().map(decode_description).collect(),
        other => Err(DbError::SchemaDecode(format!(
            "schema must be an array, got {}",
            other
        ))),
    }
}

fn encode_leaf(leaf: &LeafNode) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("__type".into(), Value::String(leaf.kind.as_str().into()));
    if let Some(default) = &leaf.default {
        map.insert("__default".into(), default.clone());
    }
    map.insert("__required".into(), Value::Bool(leaf.required));
    map.insert("__allowUpdate".into(), Value::Bool(leaf.allow_update));
    if let Some(values) = &leaf.enum_values {
        map.insert("__enum".into(), Value::Array(values.clone()));
    }
    if let Some(item_type) = leaf.item_type {
        map.insert("__itemtype".into(), Value::String(item_type.as_str().into()));
    }
    map
}

fn encode_node(node: &PropertyNode) -> Value {
    match node {
        PropertyNode::Leaf(leaf) | PropertyNode::ArrayOfScalars(leaf) => Value::Object(encode_leaf(leaf)),
        PropertyNode::ArrayOfObjects(leaf, schema) => {
            let mut map = encode_leaf(leaf);
            map.insert("__schema".into(), encode_properties(schema));
            Value::Object(map)
        }
        PropertyNode::Object(props) => encode_properties(props),
    }
}

pub fn encode_properties(props: &Properties) -> Value {
    Value::Object(
        props
            .iter()
            .map(|(name, node)| (name.clone(), encode_node(node)))
            .collect(),
    )
}

fn encode_description(desc: &SchemaDescription) -> Value {
    let mut map = Map::new();
    map.insert("name".into(), Value::String(desc.name.clone()));
    if let Some(kind) = &desc.kind {
        map.insert("type".into(), Value::String(kind.clone()));
    }
    if let Some(collection) = &desc.collection {
        map.insert("collection".into(), Value::String(collection.clone()));
    }
    map.insert(
        "extends".into(),
        Value::Array(desc.extends.iter().cloned().map(Value::String).collect()),
    );
    map.insert("properties".into(), encode_properties(&desc.properties));
    if let Some(roles) = &desc.roles {
        map.insert("roles".into(), Value::Array(roles.clone()));
    }
    if let Some(remote) = &desc.remote {
        map.insert("remote".into(), Value::String(remote.clone()));
    }
    if let Some(relationship) = &desc.relationship {
        map.insert("$relationship".into(), Value::String(relationship.clone()));
    }
    Value::Object(map)
}

pub fn encode_value(schemas: &[SchemaDescription]) -> Value {
    Value::Array(schemas.iter().map(encode_description).collect())
}

/// Encode a schema list into its stored text form.
pub fn encode(schemas: &[SchemaDescription]) -> String {
    encode_value(schemas).to_string()
}

fn timestamp_leaf() -> PropertyNode {
    PropertyNode::Leaf(
        LeafNode::new(PropertyType::Date)
            .with_default(Value::Null)
            .read_only(),
    )
}

/// Expand authored descriptions into collection roots.
///
/// Only `collection` entries survive. `extends` tags naming another entry
/// pull in its properties (the collection's own definitions win), and
/// `timestamps` injects the lifecycle fields.
pub fn build_collections(descriptions: &[SchemaDescription]) -> Vec<CollectionSchema> {
    descriptions
        .iter()
        .filter(|d| d.is_collection())
        .map(|desc| {
            let mut properties = Properties::new();
            for tag in &desc.extends {
                if tag == TIMESTAMPS {
                    continue;
                }
                match descriptions.iter().find(|d| &d.name == tag) {
                    Some(base) if base.name != desc.name => properties.merge_from(&base.properties),
                    _ => warn!(schema = %desc.name, extends = %tag, "Unknown schema extension, ignoring"),
                }
            }
            properties.merge_from(&desc.properties);

            if desc.extends.iter().any(|e| e == TIMESTAMPS) {
                for field in ["createdAt", "updatedAt"] {
                    if !properties.contains(field) {
                        properties.insert(field, timestamp_leaf());
                    }
                }
            }

            CollectionSchema {
                name: desc.name.clone(),
                collection: desc.collection.clone().unwrap_or_else(|| desc.name.clone()),
                extends: desc.extends.clone(),
                properties,
                roles: desc.roles.clone(),
                remote: desc.remote.clone(),
                relationship: desc.relationship.clone(),
            }
        })
        .collect()
}
