//! Collection models: one schema-bound CRUD surface, three backings.
//!
//! [`LocalCollection`] stores documents in this instance's sled database,
//! [`RemoteCollection`] forwards every call to a peer after a handshake, and
//! [`SplitCollection`] composes the two. The registry picks the variant once
//! and hands out [`AppCollection`].

mod local;
mod remote;
mod split;

pub use local::LocalCollection;
pub use remote::RemoteCollection;
pub use split::SplitCollection;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::document::Document;
use crate::error::{DbError, Result};
use crate::filter::Filter;
use crate::ids::DocId;
use crate::query::{parse_query, Env};
use crate::schema::{flatten, validate, CollectionSchema, FlatSchema, ValidationReport};
use crate::storage::{DocumentStream, FindOptions};
use crate::update::{PathUpdater, UpdateOutcome, UpdateRequest};

/// Registry key of a collection model.
pub fn model_key(app_short_id: Option<&str>, collection: &str) -> String {
    match app_short_id {
        Some(short) => format!("{}-{}", short, collection),
        None => collection.to_string(),
    }
}

/// A role's row-level restriction as authored in a collection schema.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthFilter {
    pub env: serde_json::Map<String, Value>,
    pub query: Value,
}

/// Everything derived once from a collection schema.
#[derive(Clone, Debug)]
pub struct SchemaModel {
    pub schema: Arc<CollectionSchema>,
    pub flat: Arc<FlatSchema>,
    pub updater: Arc<PathUpdater>,
    pub app_short_id: Option<String>,
}

impl SchemaModel {
    pub fn new(schema: CollectionSchema, app_short_id: Option<String>) -> Result<Self> {
        let flat = flatten(&schema)?;
        let updater = PathUpdater::new(&schema)?;
        Ok(Self {
            schema: Arc::new(schema),
            flat: Arc::new(flat),
            updater: Arc::new(updater),
            app_short_id,
        })
    }

    pub fn key(&self) -> String {
        model_key(self.app_short_id.as_deref(), &self.schema.collection)
    }

    pub fn collection_name(&self) -> &str {
        &self.schema.collection
    }

    pub fn validate(&self, body: &Value) -> ValidationReport {
        validate(&self.schema, body)
    }

    pub fn parse_query(&self, query: &Value, env: &Env) -> Result<Filter> {
        parse_query(query, env, &self.flat)
    }

    pub fn validate_update(&self, updates: &[UpdateRequest]) -> Result<()> {
        self.updater.validate(updates)
    }

    /// The auth filter declared for `role` in this collection's `roles`.
    pub fn role_filter(&self, role: &str) -> Result<Option<AuthFilter>> {
        let Some(roles) = &self.schema.roles else {
            return Ok(None);
        };
        let Some(rule) = roles
            .iter()
            .find(|r| r.get("name").and_then(Value::as_str) == Some(role))
        else {
            return Ok(None);
        };
        match rule.get("authFilter") {
            None | Some(Value::Null) => Ok(None),
            Some(filter) => serde_json::from_value(filter.clone()).map(Some).map_err(|e| {
                DbError::Config(format!("invalid authFilter for role {} on {}: {}", role, self.key(), e))
            }),
        }
    }
}

/// Result of [`DocumentCollection::find`]: a list, or a cursor when the
/// options asked for streaming.
pub enum FindResult {
    Documents(Vec<Document>),
    Cursor(DocumentStream),
}

impl FindResult {
    pub async fn collect(self) -> Result<Vec<Document>> {
        match self {
            FindResult::Documents(docs) => Ok(docs),
            FindResult::Cursor(cursor) => cursor.try_collect().await,
        }
    }

    pub fn into_stream(self) -> DocumentStream {
        match self {
            FindResult::Documents(docs) => stream::iter(docs.into_iter().map(Ok)).boxed(),
            FindResult::Cursor(cursor) => cursor,
        }
    }
}

/// The CRUD contract shared by every collection backing.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    fn model(&self) -> &SchemaModel;

    /// Insert one document or an array of them. `internals` (e.g. `_appId`)
    /// are merged onto every document after schema defaults. Returns the
    /// stored documents in input order.
    async fn add(&self, body: Value, internals: Document) -> Result<Vec<Document>>;

    /// Replace the given top-level fields of one document.
    async fn update(&self, details: Document, id: DocId) -> Result<Option<Document>>;

    async fn exists(&self, id: DocId, extra: Option<&Filter>) -> Result<bool>;

    /// Natural-key duplicate check; collections without one never report
    /// duplicates.
    async fn is_duplicate(&self, _details: &Value) -> Result<bool> {
        Ok(false)
    }

    async fn rm(&self, id: DocId) -> Result<bool>;

    async fn rm_bulk(&self, ids: &[DocId]) -> Result<usize> {
        self.rm_all(&Filter::id_in(ids)).await
    }

    async fn rm_all(&self, filter: &Filter) -> Result<usize>;

    async fn find_by_id(&self, id: DocId) -> Result<Option<Document>>;

    async fn find(&self, filter: &Filter, options: FindOptions) -> Result<FindResult>;

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>>;

    async fn find_all(&self) -> Result<Vec<Document>> {
        self.find(&Filter::All, FindOptions::default()).await?.collect().await
    }

    async fn find_all_by_id(&self, ids: &[DocId]) -> Result<Vec<Document>>;

    async fn count(&self, filter: &Filter) -> Result<usize>;

    /// Validate and apply a path-update batch (see [`PathUpdater`]).
    async fn update_by_path(
        &self,
        updates: Vec<UpdateRequest>,
        default_id: Option<DocId>,
    ) -> Result<Vec<UpdateOutcome>>;
}

/// A registered collection model.
#[derive(Clone)]
pub enum AppCollection {
    Local(Arc<LocalCollection>),
    Remote(Arc<RemoteCollection>),
    Split(Arc<SplitCollection>),
}

impl AppCollection {
    pub fn kind(&self) -> &'static str {
        match self {
            AppCollection::Local(_) => "local",
            AppCollection::Remote(_) => "remote",
            AppCollection::Split(_) => "split",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, AppCollection::Local(_))
    }
}

impl fmt::Debug for AppCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCollection")
            .field("kind", &self.kind())
            .field("key", &self.model().key())
            .finish()
    }
}

impl Deref for AppCollection {
    type Target = dyn DocumentCollection;

    fn deref(&self) -> &Self::Target {
        match self {
            AppCollection::Local(c) => c.as_ref(),
            AppCollection::Remote(c) => c.as_ref(),
            AppCollection::Split(c) => c.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{build_collections, decode_value};
    use serde_json::json;

    #[test]
    fn test_model_key_and_role_filter() {
        let list = decode_value(&json!([{
            "name": "orders",
            "properties": {"customerId": {"__type": "number"}},
            "roles": [
                {"name": "public"},
                {"name": "customer", "authFilter": {
                    "env": {"mine": {"schema.orders.customerId": {"$gt": 0}}},
                    "query": {"customerId": {"$in": "env.mine"}}
                }}
            ]
        }]))
        .unwrap();
        let model = SchemaModel::new(build_collections(&list).remove(0), Some("AbCd".into())).unwrap();
        assert_eq!(model.key(), "AbCd-orders");
        assert_eq!(model_key(None, "apps"), "apps");

        assert!(model.role_filter("public").unwrap().is_none());
        assert!(model.role_filter("nobody").unwrap().is_none());
        let filter = model.role_filter("customer").unwrap().unwrap();
        assert!(filter.env.contains_key("mine"));
        assert_eq!(filter.query, json!({"customerId": {"$in": "env.mine"}}));
    }

    #[test]
    fn test_app_collection_debug_names_kind_and_key() {
        let list = decode_value(&json!([{"name": "notes", "properties": {"body": {"__type": "string"}}}])).unwrap();
        let model = SchemaModel::new(build_collections(&list).remove(0), Some("AbCd".into())).unwrap();
        let storage = crate::storage::Storage::temporary().unwrap();
        let store = storage.collection(&model.key()).unwrap();
        let notes = AppCollection::Local(Arc::new(LocalCollection::new(model, store)));
        let shown = format!("{:?}", notes);
        assert!(shown.contains("local"));
        assert!(shown.contains("AbCd-notes"));
        let missing: Result<AppCollection> = Err(DbError::Config("gone".into()));
        assert!(missing.unwrap_err().to_string().contains("gone"));
    }
}
