//! Path-update engine.
//!
//! A collection schema compiles into an ordered table of path patterns.
//! Each incoming `{path, value}` is matched against the table in declaration
//! order (first match wins), which decides whether it replaces a scalar,
//! appends to an array, or removes an array element.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::document::{format_date, now_value, parse_date};
use crate::error::{DbError, Result};
use crate::ids::DocId;
use crate::schema::{
    apply_nested_properties, type_matches, CollectionSchema, LeafNode, Properties, PropertyNode,
    PropertyType,
};
use crate::storage::{StoreCollection, UpdateOp};

pub const REMOVE_MARKER: &str = "__remove__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    #[serde(rename = "scalar")]
    Scalar,
    #[serde(rename = "vector-add")]
    VectorAdd,
    #[serde(rename = "vector-rm")]
    VectorRemove,
}

/// One entry of the compiled pattern table.
#[derive(Clone, Debug)]
pub struct PathContext {
    pub pattern: Regex,
    pub kind: UpdateKind,
    pub allowed_values: Option<Vec<Value>>,
    value_type: Option<PropertyType>,
    element: Option<Properties>,
}

impl PathContext {
    fn new(source: &str, kind: UpdateKind, leaf: Option<&LeafNode>) -> Result<Self> {
        let pattern = Regex::new(&format!("^{}$", source))
            .map_err(|e| DbError::SchemaFlatten(format!("bad update path pattern {}: {}", source, e)))?;
        Ok(Self {
            pattern,
            kind,
            allowed_values: leaf.and_then(|l| l.enum_values.clone()),
            value_type: None,
            element: None,
        })
    }

    fn typed(mut self, kind: Option<PropertyType>) -> Self {
        self.value_type = kind;
        self
    }

    fn with_element(mut self, element: &Properties) -> Self {
        self.element = Some(element.clone());
        self
    }
}

/// A single requested change. `id` may be omitted when the whole batch
/// targets one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DocId>,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

impl UpdateRequest {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            id: None,
            path: path.into(),
            value,
        }
    }

    pub fn for_id(mut self, id: DocId) -> Self {
        self.id = Some(id);
        self
    }
}

/// What was applied, in request order; the realtime layer announces these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub id: DocId,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub path: String,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub struct PathUpdater {
    contexts: Vec<PathContext>,
    timestamps: bool,
}

impl PathUpdater {
    pub fn new(schema: &CollectionSchema) -> Result<Self> {
        let mut contexts = Vec::new();
        compile(&schema.properties, "", &mut contexts)?;
        Ok(Self {
            contexts,
            timestamps: schema.has_timestamps(),
        })
    }

    pub fn contexts(&self) -> &[PathContext] {
        &self.contexts
    }

    fn context_for(&self, path: &str) -> Option<&PathContext> {
        self.contexts.iter().find(|c| c.pattern.is_match(path))
    }

    fn check(&self, update: &UpdateRequest) -> Result<&PathContext> {
        let context = self.context_for(&update.path).ok_or_else(|| {
            DbError::validation("invalid_path", format!("Invalid update path: {}", update.path))
        })?;

        if context.kind == UpdateKind::VectorRemove {
            return Ok(context);
        }
        let invalid = || {
            DbError::validation(
                "invalid_value",
                format!("Invalid value {} for {}", update.value, update.path),
            )
        };
        if let Some(allowed) = &context.allowed_values {
            if !allowed.contains(&update.value) {
                return Err(invalid());
            }
        }
        if let Some(kind) = context.value_type {
            if !type_matches(kind, &update.value) {
                return Err(invalid());
            }
        }
        Ok(context)
    }

    /// Check every update against the pattern table, surfacing the first
    /// violation.
    pub fn validate(&self, updates: &[UpdateRequest]) -> Result<()> {
        for update in updates {
            self.check(update)?;
        }
        Ok(())
    }

    fn to_op(&self, context: &PathContext, update: &UpdateRequest) -> Result<(UpdateOp, Value)> {
        Ok(match context.kind {
            UpdateKind::Scalar => {
                let value = match (&context.element, &update.value) {
                    (Some(element), Value::Object(_)) => {
                        Value::Object(apply_nested_properties(element, &update.value))
                    }
                    (None, Value::String(s)) if context.value_type == Some(PropertyType::Date) => {
                        match parse_date(s) {
                            Some(date) => Value::String(format_date(&date)),
                            None => now_value(),
                        }
                    }
                    _ => update.value.clone(),
                };
                (
                    UpdateOp::Set {
                        path: update.path.clone(),
                        value: value.clone(),
                    },
                    value,
                )
            }
            UpdateKind::VectorAdd => {
                let value = match &context.element {
                    Some(element) => Value::Object(apply_nested_properties(element, &update.value)),
                    None => update.value.clone(),
                };
                (
                    UpdateOp::Push {
                        path: update.path.clone(),
                        value: value.clone(),
                    },
                    value,
                )
            }
            UpdateKind::VectorRemove => {
                let trimmed = update
                    .path
                    .strip_suffix(&format!(".{}", REMOVE_MARKER))
                    .unwrap_or(&update.path);
                let (array, index) = trimmed
                    .rsplit_once('.')
                    .and_then(|(array, index)| Some((array, index.parse::<usize>().ok()?)))
                    .ok_or_else(|| {
                        DbError::validation("invalid_path", format!("Invalid update path: {}", update.path))
                    })?;
                (
                    UpdateOp::RemoveAt {
                        path: array.to_string(),
                        index,
                    },
                    Value::from(index),
                )
            }
        })
    }

    /// Validate then apply a batch. Updates are grouped per target document
    /// (first-appearance order) and each document receives one combined
    /// write holding its updates in request order, so later writes to a path
    /// win. Nothing is written unless every update is valid and every target
    /// exists.
    pub fn apply(
        &self,
        store: &StoreCollection,
        updates: &[UpdateRequest],
        default_id: Option<DocId>,
    ) -> Result<Vec<UpdateOutcome>> {
        let mut planned = Vec::with_capacity(updates.len());
        for update in updates {
            let context = self.check(update)?;
            let id = update.id.or(default_id).ok_or_else(|| {
                DbError::validation("invalid_id", format!("No target id for {}", update.path))
            })?;
            let (op, value) = self.to_op(context, update)?;
            planned.push((id, op, UpdateOutcome {
                id,
                kind: context.kind,
                path: update.path.clone(),
                value,
            }));
        }

        let mut order: Vec<DocId> = Vec::new();
        let mut grouped: HashMap<DocId, Vec<UpdateOp>> = HashMap::new();
        for (id, op, _) in &planned {
            grouped
                .entry(*id)
                .or_insert_with(|| {
                    order.push(*id);
                    Vec::new()
                })
                .push(op.clone());
        }

        let mut batch = Vec::with_capacity(order.len());
        for id in order {
            let mut ops = grouped.remove(&id).unwrap_or_default();
            if self.timestamps {
                ops.push(UpdateOp::Set {
                    path: "updatedAt".into(),
                    value: now_value(),
                });
            }
            batch.push((id, ops));
        }
        store.update_many(&batch)?;
        debug!(collection = %store.name(), documents = batch.len(), updates = planned.len(), "Applied path updates");

        Ok(planned.into_iter().map(|(_, _, outcome)| outcome).collect())
    }
}

fn join(prefix: &str, name: &str) -> String {
    let name = regex::escape(name);
    if prefix.is_empty() {
        name
    } else {
        format!("{}\\.{}", prefix, name)
    }
}

/// Build the table depth-first in declaration order. Per array the removal
/// pattern comes first, then whole-element replacement, then the element's
/// own fields, and the bare array path (append) last.
fn compile(props: &Properties, prefix: &str, out: &mut Vec<PathContext>) -> Result<()> {
    for (name, node) in props.iter() {
        let path = join(prefix, name);
        match node {
            PropertyNode::Leaf(leaf) => {
                if leaf.allow_update {
                    out.push(PathContext::new(&path, UpdateKind::Scalar, Some(leaf))?.typed(Some(leaf.kind)));
                }
            }
            PropertyNode::ArrayOfScalars(leaf) => {
                if leaf.allow_update {
                    let element = format!("{}\\.\\d+", path);
                    out.push(PathContext::new(
                        &format!("{}\\.{}", element, REMOVE_MARKER),
                        UpdateKind::VectorRemove,
                        None,
                    )?);
                    out.push(PathContext::new(&element, UpdateKind::Scalar, Some(leaf))?.typed(leaf.item_type));
                    out.push(PathContext::new(&path, UpdateKind::VectorAdd, Some(leaf))?.typed(leaf.item_type));
                }
            }
            PropertyNode::ArrayOfObjects(leaf, schema) => {
                if leaf.allow_update {
                    let element = format!("{}\\.\\d+", path);
                    out.push(PathContext::new(
                        &format!("{}\\.{}", element, REMOVE_MARKER),
                        UpdateKind::VectorRemove,
                        None,
                    )?);
                    out.push(PathContext::new(&element, UpdateKind::Scalar, None)?.with_element(schema));
                    compile(schema, &element, out)?;
                    out.push(PathContext::new(&path, UpdateKind::VectorAdd, None)?.with_element(schema));
                }
            }
            PropertyNode::Object(children) => compile(children, &path, out)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::schema::{build_collections, decode_value};
    use crate::storage::Storage;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        let list = decode_value(&json!([{
            "name": "companies",
            "extends": ["timestamps"],
            "properties": {
                "name": {"__type": "string"},
                "status": {"__type": "string", "__enum": ["lead", "client"]},
                "secret": {"__type": "string", "__allowUpdate": false},
                "tags": {"__type": "array", "__itemtype": "string"},
                "address": {"city": {"__type": "string"}},
                "contacts": {"__type": "array", "__schema": {
                    "name": {"__type": "string"},
                    "role": {"__type": "string", "__default": "staff"}
                }}
            }
        }]))
        .unwrap();
        build_collections(&list).remove(0)
    }

    fn seeded() -> (Storage, StoreCollection, DocId) {
        let storage = Storage::temporary().unwrap();
        let store = storage.collection("abcd-companies").unwrap();
        let id = DocId::new();
        let mut doc = Document::new();
        doc.insert("_id".into(), id.to_value());
        doc.insert("name".into(), json!("Acme"));
        doc.insert("tags".into(), json!(["a", "b", "c"]));
        doc.insert("contacts".into(), json!([{"name": "x", "role": "boss"}]));
        doc.insert("updatedAt".into(), Value::Null);
        store.insert_one(doc).unwrap();
        (storage, store, id)
    }

    #[test]
    fn test_pattern_table_order() {
        let updater = PathUpdater::new(&schema()).unwrap();
        let patterns: Vec<&str> = updater.contexts().iter().map(|c| c.pattern.as_str()).collect();
        assert_eq!(
            patterns,
            vec![
                "^name$",
                "^status$",
                "^tags\\.\\d+\\.__remove__$",
                "^tags\\.\\d+$",
                "^tags$",
                "^address\\.city$",
                "^contacts\\.\\d+\\.__remove__$",
                "^contacts\\.\\d+$",
                "^contacts\\.\\d+\\.name$",
                "^contacts\\.\\d+\\.role$",
                "^contacts$",
            ]
        );
    }

    #[test]
    fn test_validate_rejects_paths_and_values() {
        let updater = PathUpdater::new(&schema()).unwrap();
        let err = updater.validate(&[UpdateRequest::new("secret", json!("x"))]).unwrap_err();
        assert_eq!(err.code(), "invalid_path");
        let err = updater.validate(&[UpdateRequest::new("createdAt", json!(null))]).unwrap_err();
        assert_eq!(err.code(), "invalid_path");
        let err = updater.validate(&[UpdateRequest::new("status", json!("prospect"))]).unwrap_err();
        assert_eq!(err.code(), "invalid_value");
        let err = updater.validate(&[UpdateRequest::new("name", json!(5))]).unwrap_err();
        assert_eq!(err.code(), "invalid_value");
        assert!(updater
            .validate(&[
                UpdateRequest::new("status", json!("client")),
                UpdateRequest::new("contacts.0.name", json!("y")),
                UpdateRequest::new("tags.1.__remove__", Value::Null),
            ])
            .is_ok());
    }

    #[test]
    fn test_invalid_entry_aborts_whole_batch() {
        let (_storage, store, id) = seeded();
        let updater = PathUpdater::new(&schema()).unwrap();
        let before = store.get(&id).unwrap();
        let err = updater
            .apply(
                &store,
                &[
                    UpdateRequest::new("name", json!("B")),
                    UpdateRequest::new("address.city", json!("Leeds")),
                    UpdateRequest::new("nope", json!(1)),
                ],
                Some(id),
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_path");
        assert_eq!(store.get(&id).unwrap(), before);
    }

    #[test]
    fn test_last_write_wins_and_timestamps() {
        let (_storage, store, id) = seeded();
        let updater = PathUpdater::new(&schema()).unwrap();
        let outcomes = updater
            .apply(
                &store,
                &[UpdateRequest::new("name", json!("A")), UpdateRequest::new("name", json!("B"))],
                Some(id),
            )
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        let doc = store.get(&id).unwrap().unwrap();
        assert_eq!(doc["name"], json!("B"));
        assert!(doc["updatedAt"].is_string());
    }

    #[test]
    fn test_vector_add_then_remove() {
        let (_storage, store, id) = seeded();
        let updater = PathUpdater::new(&schema()).unwrap();

        let outcomes = updater
            .apply(&store, &[UpdateRequest::new("contacts", json!({"name": "y"}))], Some(id))
            .unwrap();
        assert_eq!(outcomes[0].kind, UpdateKind::VectorAdd);
        assert_eq!(outcomes[0].value, json!({"name": "y", "role": "staff"}));
        let doc = store.get(&id).unwrap().unwrap();
        assert_eq!(doc["contacts"], json!([{"name": "x", "role": "boss"}, {"name": "y", "role": "staff"}]));

        updater
            .apply(&store, &[UpdateRequest::new("tags", json!("d"))], Some(id))
            .unwrap();
        let outcomes = updater
            .apply(&store, &[UpdateRequest::new("tags.1.__remove__", Value::Null)], Some(id))
            .unwrap();
        assert_eq!(outcomes[0].kind, UpdateKind::VectorRemove);
        let doc = store.get(&id).unwrap().unwrap();
        assert_eq!(doc["tags"], json!(["a", "c", "d"]));
    }

    #[test]
    fn test_unknown_target_writes_nothing() {
        let (_storage, store, id) = seeded();
        let updater = PathUpdater::new(&schema()).unwrap();
        let err = updater
            .apply(
                &store,
                &[
                    UpdateRequest::new("name", json!("Z")).for_id(id),
                    UpdateRequest::new("name", json!("Z")).for_id(DocId::new()),
                ],
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_id");
        assert_eq!(store.get(&id).unwrap().unwrap()["name"], json!("Acme"));
    }

    #[test]
    fn test_failing_document_rolls_back_earlier_documents() {
        let (_storage, store, first) = seeded();
        let second = DocId::new();
        let mut doc = Document::new();
        doc.insert("_id".into(), second.to_value());
        doc.insert("name".into(), json!("Bolt"));
        doc.insert("tags".into(), json!(["only"]));
        store.insert_one(doc).unwrap();
        let before = (store.get(&first).unwrap(), store.get(&second).unwrap());

        let updater = PathUpdater::new(&schema()).unwrap();
        let err = updater
            .apply(
                &store,
                &[
                    UpdateRequest::new("name", json!("Changed")).for_id(first),
                    UpdateRequest::new("tags.5.__remove__", Value::Null).for_id(second),
                ],
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_path");
        assert_eq!((store.get(&first).unwrap(), store.get(&second).unwrap()), before);
        assert_eq!(store.get(&first).unwrap().unwrap()["name"], json!("Acme"));
    }
}
