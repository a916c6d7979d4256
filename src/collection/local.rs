use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{DocumentCollection, FindResult, SchemaModel};
use crate::document::{now_value, Document, ID_FIELD};
use crate::error::Result;
use crate::filter::Filter;
use crate::ids::DocId;
use crate::schema::apply_properties;
use crate::storage::{FindOptions, StoreCollection, UpdateOp};
use crate::update::{UpdateOutcome, UpdateRequest};

/// Collection stored in this instance's database.
pub struct LocalCollection {
    model: SchemaModel,
    store: StoreCollection,
}

impl LocalCollection {
    pub fn new(model: SchemaModel, store: StoreCollection) -> Self {
        Self { model, store }
    }

    pub fn store(&self) -> &StoreCollection {
        &self.store
    }

    /// Shape one input body into the stored document.
    fn prepare(&self, body: &Value, internals: &Document) -> Result<Document> {
        let supplied = body
            .get(ID_FIELD)
            .or_else(|| body.get("id").filter(|_| !self.model.flat.contains("id")));
        let id = match supplied {
            Some(value) if !value.is_null() => DocId::from_value(value)?,
            _ => DocId::new(),
        };

        let mut doc = Document::new();
        doc.insert(ID_FIELD.into(), id.to_value());
        doc.extend(apply_properties(&self.model.schema, body));
        for (key, value) in internals {
            doc.insert(key.clone(), value.clone());
        }

        if self.model.schema.has_timestamps() {
            doc.insert("createdAt".into(), now_value());
            let updated = body.get("updatedAt").cloned().unwrap_or(Value::Null);
            doc.insert("updatedAt".into(), updated);
        }
        Ok(doc)
    }
}

#[async_trait]
impl DocumentCollection for LocalCollection {
    fn model(&self) -> &SchemaModel {
        &self.model
    }

    async fn add(&self, body: Value, internals: Document) -> Result<Vec<Document>> {
        let docs = match &body {
            Value::Array(items) => items
                .iter()
                .map(|item| self.prepare(item, &internals))
                .collect::<Result<Vec<_>>>()?,
            single => vec![self.prepare(single, &internals)?],
        };
        self.store.insert_many(docs)
    }

    async fn update(&self, details: Document, id: DocId) -> Result<Option<Document>> {
        let ops: Vec<UpdateOp> = details
            .into_iter()
            .filter(|(key, _)| key != ID_FIELD)
            .map(|(path, value)| UpdateOp::Set { path, value })
            .collect();
        self.store.update_one(&id, &ops)
    }

    async fn exists(&self, id: DocId, extra: Option<&Filter>) -> Result<bool> {
        let Some(doc) = self.store.get(&id)? else {
            return Ok(false);
        };
        Ok(extra.map_or(true, |f| f.matches(&Value::Object(doc))))
    }

    async fn rm(&self, id: DocId) -> Result<bool> {
        self.store.delete_one(&id)
    }

    async fn rm_all(&self, filter: &Filter) -> Result<usize> {
        self.store.delete_many(filter)
    }

    async fn find_by_id(&self, id: DocId) -> Result<Option<Document>> {
        self.store.get(&id)
    }

    async fn find(&self, filter: &Filter, options: FindOptions) -> Result<FindResult> {
        if options.stream {
            debug!(collection = %self.model.key(), "Streaming find");
            return Ok(FindResult::Cursor(self.store.stream(filter.clone(), options)?));
        }
        Ok(FindResult::Documents(self.store.find(filter, &options)?))
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>> {
        self.store.find_one(filter)
    }

    async fn find_all_by_id(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        self.store.find(&Filter::id_in(ids), &FindOptions::default())
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        self.store.count(filter)
    }

    async fn update_by_path(
        &self,
        updates: Vec<UpdateRequest>,
        default_id: Option<DocId>,
    ) -> Result<Vec<UpdateOutcome>> {
        self.model.updater.apply(&self.store, &updates, default_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_date;
    use crate::schema::{build_collections, decode_value};
    use crate::storage::Storage;
    use futures::StreamExt;
    use serde_json::json;

    fn contacts() -> (Storage, LocalCollection) {
        let list = decode_value(&json!([{
            "name": "contacts",
            "extends": ["timestamps"],
            "properties": {
                "name": {"__type": "string", "__allowUpdate": true},
                "age": {"__type": "number", "__allowUpdate": true},
                "tags": {"__type": "array", "__itemtype": "string", "__allowUpdate": true}
            }
        }]))
        .unwrap();
        let model = SchemaModel::new(build_collections(&list).remove(0), Some("x1".into())).unwrap();
        let storage = Storage::temporary().unwrap();
        let store = storage.collection(&model.key()).unwrap();
        (storage, LocalCollection::new(model, store))
    }

    #[tokio::test]
    async fn test_add_applies_defaults_internals_and_timestamps() {
        let (_storage, contacts) = contacts();
        let mut internals = Document::new();
        internals.insert("_appId".into(), json!("app-1"));

        let added = contacts
            .add(json!({"name": "Ann", "junk": 1, "updatedAt": "2024-01-01T00:00:00.000Z"}), internals)
            .await
            .unwrap();
        assert_eq!(added.len(), 1);
        let doc = &added[0];
        assert_eq!(doc.keys().next().map(String::as_str), Some(ID_FIELD));
        assert_eq!(doc["name"], json!("Ann"));
        assert_eq!(doc["tags"], json!([]));
        assert_eq!(doc["_appId"], json!("app-1"));
        assert!(parse_date(doc["createdAt"].as_str().unwrap()).is_some());
        assert_eq!(doc["updatedAt"], json!("2024-01-01T00:00:00.000Z"));
        assert!(!doc.contains_key("junk"));

        let id = DocId::from_value(&doc[ID_FIELD]).unwrap();
        assert_eq!(contacts.find_by_id(id).await.unwrap().as_ref(), Some(doc));
    }

    #[tokio::test]
    async fn test_batch_add_keeps_order_and_supplied_ids() {
        let (_storage, contacts) = contacts();
        let id = DocId::new();
        let added = contacts
            .add(json!([{"name": "A"}, {"id": id.to_string(), "name": "B"}]), Document::new())
            .await
            .unwrap();
        assert_eq!(added[0]["name"], json!("A"));
        assert_eq!(added[1][ID_FIELD], id.to_value());

        let err = contacts
            .add(json!({"_id": id.to_string(), "name": "C"}), Document::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "duplicate");
        assert_eq!(contacts.count(&Filter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_exists_and_removal() {
        let (_storage, contacts) = contacts();
        let added = contacts
            .add(json!([{"name": "A", "age": 1}, {"name": "B", "age": 2}, {"name": "C", "age": 3}]), Document::new())
            .await
            .unwrap();
        let ids: Vec<DocId> = added.iter().map(|d| DocId::from_value(&d[ID_FIELD]).unwrap()).collect();

        let mut details = Document::new();
        details.insert("age".into(), json!(10));
        let updated = contacts.update(details, ids[0]).await.unwrap().unwrap();
        assert_eq!(updated["age"], json!(10));
        assert_eq!(updated["name"], json!("A"));

        let older = contacts.model().parse_query(&json!({"age": {"$gt": 5}}), &Default::default()).unwrap();
        assert!(contacts.exists(ids[0], Some(&older)).await.unwrap());
        assert!(!contacts.exists(ids[1], Some(&older)).await.unwrap());
        assert!(!contacts.exists(DocId::new(), None).await.unwrap());

        assert_eq!(contacts.rm_bulk(&ids[..2]).await.unwrap(), 2);
        assert!(contacts.rm(ids[2]).await.unwrap());
        assert!(contacts.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_streams_when_asked() {
        let (_storage, contacts) = contacts();
        contacts
            .add(json!([{"name": "A"}, {"name": "B"}]), Document::new())
            .await
            .unwrap();
        match contacts.find(&Filter::All, FindOptions::streamed()).await.unwrap() {
            FindResult::Cursor(cursor) => assert_eq!(cursor.count().await, 2),
            FindResult::Documents(_) => panic!("expected a cursor"),
        }
        let listed = contacts.find(&Filter::All, FindOptions::default()).await.unwrap();
        assert_eq!(listed.collect().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_by_path_stamps_updated_at() {
        let (_storage, contacts) = contacts();
        let added = contacts.add(json!({"name": "A"}), Document::new()).await.unwrap();
        let id = DocId::from_value(&added[0][ID_FIELD]).unwrap();
        let outcomes = contacts
            .update_by_path(
                vec![UpdateRequest::new("name", json!("B")), UpdateRequest::new("tags", json!("t"))],
                Some(id),
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        let doc = contacts.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(doc["name"], json!("B"));
        assert_eq!(doc["tags"], json!(["t"]));
        assert!(doc["updatedAt"].is_string());
    }
}
