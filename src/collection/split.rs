use async_trait::async_trait;
use serde_json::Value;

use super::{DocumentCollection, FindResult, LocalCollection, RemoteCollection, SchemaModel};
use crate::document::Document;
use crate::error::Result;
use crate::filter::Filter;
use crate::ids::DocId;
use crate::storage::FindOptions;
use crate::update::{UpdateOutcome, UpdateRequest};

/// A federated collection that also owns a local store.
///
/// Every operation goes to the peer. The local side is opened so that
/// per-property placement can be added without migrating the namespace.
pub struct SplitCollection {
    local: LocalCollection,
    remote: RemoteCollection,
}

impl SplitCollection {
    pub fn new(local: LocalCollection, remote: RemoteCollection) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalCollection {
        &self.local
    }

    pub fn remote(&self) -> &RemoteCollection {
        &self.remote
    }
}

#[async_trait]
impl DocumentCollection for SplitCollection {
    fn model(&self) -> &SchemaModel {
        self.remote.model()
    }

    async fn add(&self, body: Value, internals: Document) -> Result<Vec<Document>> {
        self.remote.add(body, internals).await
    }

    async fn update(&self, details: Document, id: DocId) -> Result<Option<Document>> {
        self.remote.update(details, id).await
    }

    async fn exists(&self, id: DocId, extra: Option<&Filter>) -> Result<bool> {
        self.remote.exists(id, extra).await
    }

    async fn is_duplicate(&self, details: &Value) -> Result<bool> {
        self.remote.is_duplicate(details).await
    }

    async fn rm(&self, id: DocId) -> Result<bool> {
        self.remote.rm(id).await
    }

    async fn rm_bulk(&self, ids: &[DocId]) -> Result<usize> {
        self.remote.rm_bulk(ids).await
    }

    async fn rm_all(&self, filter: &Filter) -> Result<usize> {
        self.remote.rm_all(filter).await
    }

    async fn find_by_id(&self, id: DocId) -> Result<Option<Document>> {
        self.remote.find_by_id(id).await
    }

    async fn find(&self, filter: &Filter, options: FindOptions) -> Result<FindResult> {
        self.remote.find(filter, options).await
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>> {
        self.remote.find_one(filter).await
    }

    async fn find_all(&self) -> Result<Vec<Document>> {
        self.remote.find_all().await
    }

    async fn find_all_by_id(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        self.remote.find_all_by_id(ids).await
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        self.remote.count(filter).await
    }

    async fn update_by_path(
        &self,
        updates: Vec<UpdateRequest>,
        default_id: Option<DocId>,
    ) -> Result<Vec<UpdateOutcome>> {
        self.remote.update_by_path(updates, default_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::federation::memory::MemoryPeer;
    use crate::federation::{FederationSettings, RemoteTarget};
    use crate::schema::{build_collections, decode_value};
    use crate::storage::Storage;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_split_routes_everything_to_the_peer() {
        let list = decode_value(&json!([{
            "name": "shared",
            "remote": "partner.people",
            "properties": {"name": {"__type": "string"}}
        }]))
        .unwrap();
        let model = SchemaModel::new(build_collections(&list).remove(0), Some("loc1".into())).unwrap();
        let storage = Storage::temporary().unwrap();
        let local = LocalCollection::new(model.clone(), storage.collection(&model.key()).unwrap());

        let peer = MemoryPeer::new();
        let target = RemoteTarget {
            endpoint: "http://peer.test".into(),
            api_path: "peer".into(),
            token: "t".into(),
            allow_unauthorized: false,
        };
        let remote =
            RemoteCollection::connect(model, target, "people", Arc::new(peer.clone()), &FederationSettings::default())
                .await;
        let split = SplitCollection::new(local, remote);

        split.add(json!({"name": "A"}), Document::new()).await.unwrap();
        assert_eq!(split.count(&Filter::All).await.unwrap(), 1);
        assert_eq!(split.local().count(&Filter::All).await.unwrap(), 0);
        assert_eq!(peer.calls().len(), 2);
    }
}
