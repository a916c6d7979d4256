use std::fmt;

use serde_json::Value;

use crate::error::{DbError, Result};

pub const TIMESTAMPS: &str = "timestamps";

/// Storage type of a leaf property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Date,
    Id,
    Array,
}

impl PropertyType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "string" => Ok(PropertyType::String),
            "number" => Ok(PropertyType::Number),
            "boolean" => Ok(PropertyType::Boolean),
            "date" => Ok(PropertyType::Date),
            "id" => Ok(PropertyType::Id),
            "array" => Ok(PropertyType::Array),
            other => Err(DbError::SchemaDecode(format!("unknown property type '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
            PropertyType::Id => "id",
            PropertyType::Array => "array",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition carried by every typed node.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
    pub kind: PropertyType,
    pub default: Option<Value>,
    pub required: bool,
    pub allow_update: bool,
    pub enum_values: Option<Vec<Value>>,
    pub item_type: Option<PropertyType>,
}

impl LeafNode {
    pub fn new(kind: PropertyType) -> Self {
        Self {
            kind,
            default: None,
            required: false,
            allow_update: true,
            enum_values: None,
            item_type: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.allow_update = false;
        self
    }

    /// True when `id` coercion applies to this node or its items.
    pub fn holds_ids(&self) -> bool {
        self.kind == PropertyType::Id || self.item_type == Some(PropertyType::Id)
    }
}

/// One node of a property tree.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyNode {
    Leaf(LeafNode),
    ArrayOfScalars(LeafNode),
    ArrayOfObjects(LeafNode, Properties),
    Object(Properties),
}

impl PropertyNode {
    pub fn leaf(&self) -> Option<&LeafNode> {
        match self {
            PropertyNode::Leaf(leaf)
            | PropertyNode::ArrayOfScalars(leaf)
            | PropertyNode::ArrayOfObjects(leaf, _) => Some(leaf),
            PropertyNode::Object(_) => None,
        }
    }
}

/// Ordered property map; declaration order is significant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties(Vec<(String, PropertyNode)>);

impl Properties {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&PropertyNode> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, node)| node)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, node: PropertyNode) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = node,
            None => self.0.push((name, node)),
        }
    }

    /// Copy in every entry of `other`, entries of `other` winning.
    pub fn merge_from(&mut self, other: &Properties) {
        for (name, node) in other.iter() {
            self.insert(name.clone(), node.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, PropertyNode)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, PropertyNode)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, PropertyNode)>>(iter: T) -> Self {
        let mut props = Properties::new();
        for (name, node) in iter {
            props.insert(name, node);
        }
        props
    }
}

/// A schema entry as authored by an app, before `buildCollections`.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaDescription {
    pub name: String,
    pub kind: Option<String>,
    pub collection: Option<String>,
    pub extends: Vec<String>,
    pub properties: Properties,
    pub roles: Option<Vec<Value>>,
    pub remote: Option<String>,
    pub relationship: Option<String>,
}

impl SchemaDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            collection: None,
            extends: Vec::new(),
            properties: Properties::new(),
            roles: None,
            remote: None,
            relationship: None,
        }
    }

    pub fn is_collection(&self) -> bool {
        self.kind.as_deref().map_or(true, |k| k == "collection")
    }
}

/// Normalised collection root produced by `buildCollections`.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    pub collection: String,
    pub extends: Vec<String>,
    pub properties: Properties,
    pub roles: Option<Vec<Value>>,
    pub remote: Option<String>,
    pub relationship: Option<String>,
}

impl CollectionSchema {
    pub fn has_timestamps(&self) -> bool {
        self.extends.iter().any(|e| e == TIMESTAMPS)
    }
}

/// `<agreementName>.<collectionName>` reference of a federated collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteRef {
    pub agreement: String,
    pub collection: String,
}

impl RemoteRef {
    pub fn parse(descriptor: &str) -> Result<Self> {
        match descriptor.split_once('.') {
            Some((agreement, collection))
                if !agreement.is_empty() && !collection.is_empty() && !collection.contains('.') =>
            {
                Ok(Self {
                    agreement: agreement.to_string(),
                    collection: collection.to_string(),
                })
            }
            _ => Err(DbError::Config(format!(
                "invalid remote descriptor '{}'",
                descriptor
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_ref_parse() {
        let r = RemoteRef::parse("partner.orders").unwrap();
        assert_eq!(r.agreement, "partner");
        assert_eq!(r.collection, "orders");
        assert!(RemoteRef::parse("orders").is_err());
        assert!(RemoteRef::parse(".orders").is_err());
        assert!(RemoteRef::parse("a.b.c").is_err());
    }

    #[test]
    fn test_properties_insert_keeps_position() {
        let mut props = Properties::new();
        props.insert("a", PropertyNode::Leaf(LeafNode::new(PropertyType::String)));
        props.insert("b", PropertyNode::Leaf(LeafNode::new(PropertyType::Number)));
        props.insert("a", PropertyNode::Leaf(LeafNode::new(PropertyType::Boolean)));
        let names: Vec<&str> = props.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(
            props.get("a").and_then(|n| n.leaf()).map(|l| l.kind),
            Some(PropertyType::Boolean)
        );
    }
}
