//! Dotted-path view of a collection schema.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{CollectionSchema, LeafNode, Properties, PropertyNode};
use crate::error::{DbError, Result};

/// A flattened leaf. Array-of-objects nodes also carry the flattened view of
/// their element schema, relative to the element, for `$elemMatch` queries.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatNode {
    pub leaf: LeafNode,
    pub sub_schema: Option<Arc<FlatSchema>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlatSchema {
    entries: Vec<(String, FlatNode)>,
    index: HashMap<String, usize>,
}

impl FlatSchema {
    pub fn get(&self, path: &str) -> Option<&FlatNode> {
        self.index.get(path).map(|&i| &self.entries[i].1)
    }

    pub fn leaf(&self, path: &str) -> Option<&LeafNode> {
        self.get(path).map(|n| &n.leaf)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Entries in depth-first declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlatNode)> {
        self.entries.iter().map(|(p, n)| (p.as_str(), n))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, path: String, node: FlatNode) -> Result<()> {
        if self.index.contains_key(&path) {
            return Err(DbError::SchemaFlatten(format!("duplicate path '{}'", path)));
        }
        self.index.insert(path.clone(), self.entries.len());
        self.entries.push((path, node));
        Ok(())
    }
}

/// Flatten a collection schema into its dotted-path map.
pub fn flatten(schema: &CollectionSchema) -> Result<FlatSchema> {
    flatten_properties(&schema.properties)
        .map_err(|e| DbError::SchemaFlatten(format!("{}: {}", schema.name, e)))
}

pub fn flatten_properties(props: &Properties) -> Result<FlatSchema> {
    let mut out = FlatSchema::default();
    walk(props, "", &mut out)?;
    Ok(out)
}

fn walk(props: &Properties, prefix: &str, out: &mut FlatSchema) -> Result<()> {
    for (name, node) in props.iter() {
        if name.is_empty() || name.contains('.') || name.starts_with('$') {
            return Err(DbError::SchemaFlatten(format!(
                "property name '{}' under '{}' is not addressable",
                name, prefix
            )));
        }
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };

        match node {
            PropertyNode::Leaf(leaf) | PropertyNode::ArrayOfScalars(leaf) => out.push(
                path,
                FlatNode {
                    leaf: leaf.clone(),
                    sub_schema: None,
                },
            )?,
            PropertyNode::ArrayOfObjects(leaf, schema) => {
                let element = flatten_properties(schema)?;
                out.push(
                    path.clone(),
                    FlatNode {
                        leaf: leaf.clone(),
                        sub_schema: Some(Arc::new(element)),
                    },
                )?;
                walk(schema, &path, out)?;
            }
            PropertyNode::Object(children) => walk(children, &path, out)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::codec::{build_collections, decode_value};
    use serde_json::json;

    fn contacts() -> CollectionSchema {
        let list = decode_value(&json!([{
            "name": "contacts",
            "extends": ["timestamps"],
            "properties": {
                "name": {"__type": "string"},
                "address": {"city": {"__type": "string"}, "geo": {"lat": {"__type": "number"}}},
                "tags": {"__type": "array", "__itemtype": "string"},
                "notes": {"__type": "array", "__schema": {
                    "text": {"__type": "string"},
                    "links": {"__type": "array", "__schema": {"url": {"__type": "string"}}}
                }}
            }
        }]))
        .unwrap();
        build_collections(&list).remove(0)
    }

    #[test]
    fn test_flatten_paths() {
        let flat = flatten(&contacts()).unwrap();
        let keys: Vec<&str> = flat.keys().collect();
        assert_eq!(
            keys,
            vec![
                "name",
                "address.city",
                "address.geo.lat",
                "tags",
                "notes",
                "notes.text",
                "notes.links",
                "notes.links.url",
                "createdAt",
                "updatedAt",
            ]
        );
        assert!(!flat.contains("address"));
        let notes = flat.get("notes").unwrap();
        let element = notes.sub_schema.as_ref().unwrap();
        assert!(element.contains("text"));
        assert!(element.contains("links.url"));
    }

    #[test]
    fn test_flatten_is_stable() {
        let schema = contacts();
        let a = flatten(&schema).unwrap();
        let b = flatten(&schema).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_flatten_rejects_dotted_names() {
        let mut schema = contacts();
        schema.properties.insert(
            "address.city",
            PropertyNode::Leaf(LeafNode::new(crate::schema::PropertyType::String)),
        );
        assert!(matches!(flatten(&schema), Err(DbError::SchemaFlatten(_))));
    }
}
