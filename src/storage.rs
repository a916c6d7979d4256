//! Sled-backed document store.
//!
//! Every persisted collection is its own sled tree holding JSON documents
//! keyed by the 16 bytes of their `_id`. Since ids are UUIDv7, tree order is
//! insertion order, which is also the default result order.

use std::cmp::Ordering;
use std::collections::HashSet;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use tracing::debug;

use crate::document::{
    get_path, project_exclude, project_include, push_path, remove_at_path, set_path, Document,
    ID_FIELD,
};
use crate::error::{DbError, Result};
use crate::filter::{compare_values, Filter};
use crate::ids::DocId;

/// Lazily produced query results.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

impl SortDirection {
    /// Parse the `1` / `-1` convention used in query sort objects.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) if n.as_i64() == Some(1) => Some(SortDirection::Ascending),
            Value::Number(n) if n.as_i64() == Some(-1) => Some(SortDirection::Descending),
            Value::String(s) if s == "asc" || s == "ascending" => Some(SortDirection::Ascending),
            Value::String(s) if s == "desc" || s == "descending" => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

/// Read a sort object (`{"path": 1, "other": -1}`) in key order.
pub fn parse_sort(value: &Value) -> Result<Vec<(String, SortDirection)>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .iter()
            .map(|(path, dir)| {
                SortDirection::from_value(dir)
                    .map(|d| (path.clone(), d))
                    .ok_or_else(|| DbError::validation("invalid_sort", format!("Invalid sort direction {} for {}", dir, path)))
            })
            .collect(),
        other => Err(DbError::validation("invalid_sort", format!("Invalid sort {}", other))),
    }
}

pub fn sort_to_value(sort: &[(String, SortDirection)]) -> Value {
    Value::Object(
        sort.iter()
            .map(|(path, dir)| {
                let n = match dir {
                    SortDirection::Ascending => 1,
                    SortDirection::Descending => -1,
                };
                (path.clone(), Value::from(n))
            })
            .collect(),
    )
}

/// Options of a `find` call.
#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    /// Paths removed from every result.
    pub excludes: Vec<String>,
    /// Return a cursor instead of a materialised list.
    pub stream: bool,
    /// Zero means unlimited.
    pub limit: usize,
    pub skip: usize,
    pub sort: Vec<(String, SortDirection)>,
    /// When set, only these paths (and `_id`) are returned.
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn streamed() -> Self {
        Self {
            stream: true,
            ..Self::default()
        }
    }

    fn shape(&self, doc: Document) -> Document {
        let doc = match &self.projection {
            Some(paths) => project_include(&doc, paths),
            None => doc,
        };
        if self.excludes.is_empty() {
            doc
        } else {
            project_exclude(&doc, &self.excludes)
        }
    }
}

/// One element of a combined single-document update.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOp {
    Set { path: String, value: Value },
    Push { path: String, value: Value },
    RemoveAt { path: String, index: usize },
}

impl UpdateOp {
    fn apply(&self, doc: &mut Value) -> Result<()> {
        match self {
            UpdateOp::Set { path, value } => set_path(doc, path, value.clone()),
            UpdateOp::Push { path, value } => push_path(doc, path, value.clone()),
            UpdateOp::RemoveAt { path, index } => remove_at_path(doc, path, *index),
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    db: Db,
}

impl Storage {
    /// Open or create the sled database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database removed on drop, for tests and tooling.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn collection(&self, name: &str) -> Result<StoreCollection> {
        let tree = self.db.open_tree(name)?;
        Ok(StoreCollection {
            name: name.to_string(),
            tree,
        })
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        Ok(self.db.drop_tree(name)?)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|n| String::from_utf8(n.to_vec()).ok())
            .filter(|n| n != "__sled__default")
            .collect()
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<Document> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::Config(format!("stored value is not a document: {}", other))),
    }
}

fn doc_id(doc: &Document) -> Result<DocId> {
    match doc.get(ID_FIELD) {
        Some(value) => DocId::from_value(value),
        None => Err(DbError::validation("invalid_id", "Document has no _id")),
    }
}

/// Total order used for sorting: missing < null < booleans < numbers <
/// strings < everything else, then by value within a kind.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn sort_documents(docs: &mut [Document], sort: &[(String, SortDirection)]) {
    docs.sort_by(|a, b| {
        let (a, b) = (Value::Object(a.clone()), Value::Object(b.clone()));
        for (path, direction) in sort {
            let ord = sort_order(get_path(&a, path), get_path(&b, path));
            let ord = match direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Handle on one persisted collection.
#[derive(Clone)]
pub struct StoreCollection {
    name: String,
    tree: Tree,
}

impl StoreCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a batch atomically. A duplicate `_id` (against stored documents
    /// or within the batch) aborts the whole batch.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let mut seen = HashSet::new();
        let mut encoded = Vec::with_capacity(docs.len());
        for doc in &docs {
            let id = doc_id(doc)?;
            if !seen.insert(id) {
                return Err(duplicate(&self.name, &id));
            }
            encoded.push((id, serde_json::to_vec(doc)?));
        }

        let result = self.tree.transaction(|tx| {
            for (id, bytes) in &encoded {
                let key = id.as_uuid().as_bytes();
                if tx.get(key)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(duplicate(&self.name, id)));
                }
                tx.insert(&key[..], bytes.as_slice())?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!(collection = %self.name, count = docs.len(), "Inserted documents");
                Ok(docs)
            }
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    pub fn insert_one(&self, doc: Document) -> Result<Document> {
        let mut inserted = self.insert_many(vec![doc])?;
        inserted
            .pop()
            .ok_or_else(|| DbError::Config("insert returned no document".into()))
    }

    pub fn get(&self, id: &DocId) -> Result<Option<Document>> {
        match self.tree.get(id.as_uuid().as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, filter: &Filter) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let doc = Value::Object(decode(&bytes)?);
            if filter.matches(&doc) {
                if let Value::Object(map) = doc {
                    out.push(map);
                }
            }
        }
        Ok(out)
    }

    pub fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>> {
        debug!(collection = %self.name, query = %filter.to_query(), "find");
        let mut docs = self.scan(filter)?;
        if !options.sort.is_empty() {
            sort_documents(&mut docs, &options.sort);
        }
        let limit = if options.limit == 0 { usize::MAX } else { options.limit };
        Ok(docs
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .map(|d| options.shape(d))
            .collect())
    }

    /// Cursor over matching documents. Unsorted queries walk the tree
    /// lazily; sorted ones are materialised first.
    pub fn stream(&self, filter: Filter, options: FindOptions) -> Result<DocumentStream> {
        if !options.sort.is_empty() {
            let docs = self.find(&filter, &options)?;
            return Ok(stream::iter(docs.into_iter().map(Ok)).boxed());
        }

        let limit = if options.limit == 0 { usize::MAX } else { options.limit };
        let skip = options.skip;
        let matching = self.tree.iter().filter_map(move |item| {
            let decoded = item.map_err(DbError::from).and_then(|(_, bytes)| decode(&bytes));
            match decoded {
                Ok(doc) => {
                    let value = Value::Object(doc);
                    if !filter.matches(&value) {
                        return None;
                    }
                    match value {
                        Value::Object(map) => Some(Ok(map)),
                        _ => None,
                    }
                }
                Err(err) => Some(Err(err)),
            }
        });
        let shaped = matching
            .skip(skip)
            .take(limit)
            .map(move |doc| doc.map(|d| options.shape(d)));
        Ok(stream::iter(shaped).boxed())
    }

    pub fn find_one(&self, filter: &Filter) -> Result<Option<Document>> {
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let doc = Value::Object(decode(&bytes)?);
            if filter.matches(&doc) {
                if let Value::Object(map) = doc {
                    return Ok(Some(map));
                }
            }
        }
        Ok(None)
    }

    pub fn count(&self, filter: &Filter) -> Result<usize> {
        if filter.is_all() {
            return Ok(self.tree.len());
        }
        Ok(self.scan(filter)?.len())
    }

    pub fn delete_one(&self, id: &DocId) -> Result<bool> {
        let removed = self.tree.remove(id.as_uuid().as_bytes())?.is_some();
        debug!(collection = %self.name, id = %id, removed, "delete");
        Ok(removed)
    }

    pub fn delete_many(&self, filter: &Filter) -> Result<usize> {
        let mut removed = 0;
        for doc in self.scan(filter)? {
            let id = doc_id(&doc)?;
            if self.tree.remove(id.as_uuid().as_bytes())?.is_some() {
                removed += 1;
            }
        }
        debug!(collection = %self.name, removed, "delete many");
        Ok(removed)
    }

    /// Apply a combined update to one document atomically, retrying on
    /// concurrent modification. Returns the updated document, or `None` when
    /// no document has this id.
    pub fn update_one(&self, id: &DocId, ops: &[UpdateOp]) -> Result<Option<Document>> {
        let key = id.as_uuid().as_bytes();
        loop {
            let Some(current) = self.tree.get(key)? else {
                return Ok(None);
            };
            let mut doc = Value::Object(decode(&current)?);
            for op in ops {
                op.apply(&mut doc)?;
            }
            let bytes = serde_json::to_vec(&doc)?;
            match self.tree.compare_and_swap(key, Some(&current), Some(bytes))? {
                Ok(()) => {
                    debug!(collection = %self.name, id = %id, ops = ops.len(), "update");
                    return Ok(match doc {
                        Value::Object(map) => Some(map),
                        _ => None,
                    });
                }
                Err(_) => continue,
            }
        }
    }
}

impl StoreCollection {
    /// Apply combined updates to several documents in one transaction. Every
    /// document is updated or none is: an unknown id or an op that cannot be
    /// applied aborts the whole batch.
    pub fn update_many(&self, batch: &[(DocId, Vec<UpdateOp>)]) -> Result<Vec<Document>> {
        let result = self.tree.transaction(|tx| {
            let mut updated = Vec::with_capacity(batch.len());
            for (id, ops) in batch {
                let key = id.as_uuid().as_bytes();
                let Some(current) = tx.get(key)? else {
                    return Err(ConflictableTransactionError::Abort(DbError::not_found(
                        "invalid_id",
                        format!("Unknown id {}", id),
                    )));
                };
                let mut doc = decode(&current)
                    .map(Value::Object)
                    .map_err(ConflictableTransactionError::Abort)?;
                for op in ops {
                    op.apply(&mut doc).map_err(ConflictableTransactionError::Abort)?;
                }
                let bytes = serde_json::to_vec(&doc)
                    .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
                tx.insert(&key[..], bytes)?;
                if let Value::Object(map) = doc {
                    updated.push(map);
                }
            }
            Ok(updated)
        });

        match result {
            Ok(updated) => {
                debug!(collection = %self.name, count = batch.len(), "Updated documents");
                Ok(updated)
            }
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }
}

fn duplicate(collection: &str, id: &DocId) -> DbError {
    DbError::validation(
        "duplicate",
        format!("Duplicate id {} in {}", id, collection),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Condition, Operand};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        let mut map = value.as_object().cloned().unwrap();
        map.insert(ID_FIELD.into(), DocId::new().to_value());
        map
    }

    fn people() -> (Storage, StoreCollection) {
        let storage = Storage::temporary().unwrap();
        let people = storage.collection("abcd-people").unwrap();
        people
            .insert_many(vec![
                doc(json!({"name": "Ann", "age": 31, "tags": ["a"]})),
                doc(json!({"name": "Bob", "age": 25, "tags": ["b"]})),
                doc(json!({"name": "Cid", "age": 40, "tags": ["a", "c"]})),
            ])
            .unwrap();
        (storage, people)
    }

    #[test]
    fn test_insert_and_find() {
        let (_storage, people) = people();
        assert_eq!(people.count(&Filter::All).unwrap(), 3);

        let tagged = Filter::field("tags", Condition::Eq(Operand::Value(json!("a"))));
        let found = people.find(&tagged, &FindOptions::default()).unwrap();
        let names: Vec<&Value> = found.iter().map(|d| &d["name"]).collect();
        assert_eq!(names, vec![&json!("Ann"), &json!("Cid")]);

        let options = FindOptions {
            sort: vec![("age".into(), SortDirection::Descending)],
            skip: 1,
            limit: 1,
            projection: Some(vec!["name".into()]),
            ..FindOptions::default()
        };
        let found = people.find(&Filter::All, &options).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], json!("Ann"));
        assert!(found[0].get("age").is_none());
        assert!(found[0].contains_key(ID_FIELD));
    }

    #[test]
    fn test_batch_insert_is_all_or_nothing() {
        let (_storage, people) = people();
        let existing = people.find_one(&Filter::All).unwrap().unwrap();
        let err = people
            .insert_many(vec![doc(json!({"name": "New"})), existing])
            .unwrap_err();
        assert_eq!(err.code(), "duplicate");
        assert_eq!(people.count(&Filter::All).unwrap(), 3);
    }

    #[test]
    fn test_update_one_combines_ops() {
        let (_storage, people) = people();
        let ann = people.find_one(&Filter::field("name", Condition::Eq(Operand::Value(json!("Ann"))))).unwrap().unwrap();
        let id = doc_id(&ann).unwrap();
        let updated = people
            .update_one(
                &id,
                &[
                    UpdateOp::Set { path: "age".into(), value: json!(32) },
                    UpdateOp::Push { path: "tags".into(), value: json!("z") },
                    UpdateOp::RemoveAt { path: "tags".into(), index: 0 },
                ],
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated["age"], json!(32));
        assert_eq!(updated["tags"], json!(["z"]));
        assert_eq!(people.get(&id).unwrap().unwrap(), updated);
        assert!(people.update_one(&DocId::new(), &[]).unwrap().is_none());
    }

    #[test]
    fn test_update_many_is_all_or_nothing() {
        let (_storage, people) = people();
        let ids: Vec<DocId> = people
            .find(&Filter::All, &FindOptions::default())
            .unwrap()
            .iter()
            .map(|d| doc_id(d).unwrap())
            .collect();
        let rename = |name: &str| vec![UpdateOp::Set { path: "name".into(), value: json!(name) }];

        let err = people
            .update_many(&[
                (ids[0], rename("Zed")),
                (ids[1], vec![UpdateOp::RemoveAt { path: "tags".into(), index: 9 }]),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "invalid_path");
        assert_eq!(people.get(&ids[0]).unwrap().unwrap()["name"], json!("Ann"));

        let err = people
            .update_many(&[(ids[0], rename("Zed")), (DocId::new(), rename("Nobody"))])
            .unwrap_err();
        assert_eq!(err.code(), "invalid_id");
        assert_eq!(people.get(&ids[0]).unwrap().unwrap()["name"], json!("Ann"));

        let updated = people
            .update_many(&[(ids[0], rename("Zed")), (ids[2], rename("Cy"))])
            .unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(people.get(&ids[2]).unwrap().unwrap()["name"], json!("Cy"));
    }

    #[test]
    fn test_delete() {
        let (_storage, people) = people();
        let young = Filter::field("age", Condition::Lt(Operand::Value(json!(35))));
        assert_eq!(people.delete_many(&young).unwrap(), 2);
        let left = people.find_one(&Filter::All).unwrap().unwrap();
        assert!(people.delete_one(&doc_id(&left).unwrap()).unwrap());
        assert_eq!(people.count(&Filter::All).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_is_lazy_and_bounded() {
        let (_storage, people) = people();
        let options = FindOptions {
            limit: 2,
            ..FindOptions::streamed()
        };
        let docs: Vec<Document> = people
            .stream(Filter::All, options)
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["name"], json!("Ann"));
    }
}
