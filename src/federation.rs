//! Federation client: access to a peer instance's collections.
//!
//! The proxies in [`crate::collection`] only see the traits below. The
//! production implementation speaks HTTP to the peer's REST surface; tests
//! plug in an in-memory peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::document::{Document, ID_FIELD};
use crate::error::{DbError, Result};
use crate::ids::DocId;
use crate::update::{UpdateOutcome, UpdateRequest};

/// Where and as whom to reach a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub endpoint: String,
    pub api_path: String,
    pub token: String,
    pub allow_unauthorized: bool,
}

/// Handshake timing for remote-backed collections.
#[derive(Clone, Debug)]
pub struct FederationSettings {
    /// Grace period before the first connection attempt, so a cooperating
    /// peer started alongside this one can come up.
    pub handshake_delay: Duration,
    /// Give up on the handshake (and fail waiting callers) after this long.
    pub handshake_timeout: Duration,
    pub retry_interval: Duration,
    pub allow_unauthorized: bool,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            allow_unauthorized: false,
        }
    }
}

/// Body of a remote search, also accepted by the REST search route.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub query: Value,
    pub limit: usize,
    pub skip: usize,
    pub sort: Value,
    pub project: Option<Vec<String>>,
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Establish (and verify) a client session with a peer.
    async fn init(&self, target: &RemoteTarget) -> Result<Arc<dyn RemoteApi>>;
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    fn collection(&self, name: &str) -> Result<Arc<dyn RemoteCollectionApi>>;

    /// Hand the peer the token it should use to reach us; a `true` reply
    /// means the peer activated its side of the agreement.
    async fn activate_data_sharing(&self, token: &str) -> Result<bool>;
}

#[async_trait]
pub trait RemoteCollectionApi: Send + Sync {
    async fn save(&self, body: Value) -> Result<Vec<Document>>;
    async fn update(&self, id: DocId, updates: Vec<UpdateRequest>) -> Result<Vec<UpdateOutcome>>;
    async fn get(&self, id: DocId) -> Result<Option<Document>>;
    async fn remove(&self, id: DocId) -> Result<bool>;
    async fn bulk_remove(&self, ids: Vec<DocId>) -> Result<usize>;
    async fn remove_all(&self, query: Value) -> Result<usize>;
    async fn search(&self, request: SearchRequest) -> Result<Vec<Document>>;
    async fn get_all(&self) -> Result<Vec<Document>>;
    async fn bulk_get(&self, ids: Vec<DocId>) -> Result<Vec<Document>>;
    async fn count(&self, query: Value) -> Result<usize>;
}

/// Peers return documents prepared for output (`id` instead of `_id`).
fn from_peer(mut doc: Document) -> Document {
    if !doc.contains_key(ID_FIELD) {
        if let Some(id) = doc.remove("id") {
            doc.insert(ID_FIELD.into(), id);
        }
    }
    doc
}

fn all_from_peer(docs: Vec<Document>) -> Vec<Document> {
    docs.into_iter().map(from_peer).collect()
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// HTTP implementation against a peer's `/api/v1` routes.
#[derive(Clone, Default)]
pub struct HttpConnector;

impl HttpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteConnector for HttpConnector {
    async fn init(&self, target: &RemoteTarget) -> Result<Arc<dyn RemoteApi>> {
        let client = Client::builder()
            .danger_accept_invalid_certs(target.allow_unauthorized)
            .build()?;
        let api = HttpRemoteApi {
            client,
            endpoint: target.endpoint.trim_end_matches('/').to_string(),
            api_path: target.api_path.clone(),
            token: target.token.clone(),
        };

        // A peer that accepts the token for its schema route is ready.
        let _: Value = api
            .send(api.client.get(format!("{}/api/v1/app/schema", api.endpoint)))
            .await?;
        debug!(endpoint = %api.endpoint, api_path = %api.api_path, "Peer handshake complete");
        Ok(Arc::new(api))
    }
}

#[derive(Clone)]
struct HttpRemoteApi {
    client: Client,
    endpoint: String,
    api_path: String,
    token: String,
}

async fn send_as<T: DeserializeOwned>(request: RequestBuilder, token: &str) -> Result<T> {
    let response = request.bearer_auth(token).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let text = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => format!("{} ({})", body.message, body.code),
        Err(_) => text,
    };
    Err(DbError::Federation(format!("peer replied {}: {}", status, detail)))
}

impl HttpRemoteApi {
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        send_as(request, &self.token).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    fn collection(&self, name: &str) -> Result<Arc<dyn RemoteCollectionApi>> {
        Ok(Arc::new(HttpRemoteCollection {
            client: self.client.clone(),
            base: format!("{}/api/v1/data/{}/{}", self.endpoint, self.api_path, name),
            token: self.token.clone(),
        }))
    }

    async fn activate_data_sharing(&self, token: &str) -> Result<bool> {
        self.send(
            self.client
                .put(format!("{}/api/v1/app/dataSharing/activate", self.endpoint))
                .json(&json!({ "token": token })),
        )
        .await
    }
}

struct HttpRemoteCollection {
    client: Client,
    base: String,
    token: String,
}

impl HttpRemoteCollection {
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        send_as(request, &self.token).await
    }
}

#[async_trait]
impl RemoteCollectionApi for HttpRemoteCollection {
    async fn save(&self, body: Value) -> Result<Vec<Document>> {
        self.send(self.client.post(&self.base).json(&body)).await.map(all_from_peer)
    }

    async fn update(&self, id: DocId, updates: Vec<UpdateRequest>) -> Result<Vec<UpdateOutcome>> {
        self.send(self.client.put(format!("{}/doc/{}", self.base, id)).json(&updates))
            .await
    }

    async fn get(&self, id: DocId) -> Result<Option<Document>> {
        let response = self
            .client
            .get(format!("{}/doc/{}", self.base, id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Ok(None),
            s if s.is_success() => Ok(Some(from_peer(response.json().await?))),
            s => Err(DbError::Federation(format!("peer replied {} for {}", s, id))),
        }
    }

    async fn remove(&self, id: DocId) -> Result<bool> {
        self.send(self.client.delete(format!("{}/doc/{}", self.base, id)))
            .await
    }

    async fn bulk_remove(&self, ids: Vec<DocId>) -> Result<usize> {
        self.send(self.client.post(format!("{}/bulk/delete", self.base)).json(&ids))
            .await
    }

    async fn remove_all(&self, query: Value) -> Result<usize> {
        self.send(
            self.client
                .post(format!("{}/removeAll", self.base))
                .json(&json!({ "query": query })),
        )
        .await
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<Document>> {
        self.send(self.client.post(format!("{}/search", self.base)).json(&request))
            .await
            .map(all_from_peer)
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        self.send(self.client.get(&self.base)).await.map(all_from_peer)
    }

    async fn bulk_get(&self, ids: Vec<DocId>) -> Result<Vec<Document>> {
        self.send(self.client.post(format!("{}/bulk/get", self.base)).json(&ids))
            .await
            .map(all_from_peer)
    }

    async fn count(&self, query: Value) -> Result<usize> {
        self.send(
            self.client
                .post(format!("{}/count", self.base))
                .json(&json!({ "query": query })),
        )
        .await
    }
}

/// In-memory peer used by tests across the crate.
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::filter::Filter;
    use crate::query::{parse_query, Env};
    use crate::schema::FlatSchema;
    use crate::storage::{parse_sort, FindOptions, Storage, StoreCollection, UpdateOp};

    /// Stands in for a remote instance. Documents live in a temporary sled
    /// database; every call is recorded in `log`.
    #[derive(Clone)]
    pub struct MemoryPeer {
        pub storage: Storage,
        pub log: Arc<Mutex<Vec<String>>>,
        pub targets: Arc<Mutex<Vec<RemoteTarget>>>,
        pub activations: Arc<Mutex<Vec<String>>>,
        failures_left: Arc<AtomicUsize>,
        accept_activation: Arc<AtomicBool>,
    }

    impl MemoryPeer {
        pub fn new() -> Self {
            Self {
                storage: Storage::temporary().expect("temporary storage"),
                log: Arc::default(),
                targets: Arc::default(),
                activations: Arc::default(),
                failures_left: Arc::new(AtomicUsize::new(0)),
                accept_activation: Arc::new(AtomicBool::new(true)),
            }
        }

        /// Refuse the next `n` handshakes.
        pub fn fail_handshakes(&self, n: usize) {
            self.failures_left.store(n, Ordering::SeqCst);
        }

        pub fn refuse_activation(&self) {
            self.accept_activation.store(false, Ordering::SeqCst);
        }

        pub fn calls(&self) -> Vec<String> {
            self.log.lock().expect("log").clone()
        }
    }

    #[async_trait]
    impl RemoteConnector for MemoryPeer {
        async fn init(&self, target: &RemoteTarget) -> Result<Arc<dyn RemoteApi>> {
            self.targets.lock().expect("targets").push(target.clone());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DbError::Federation("peer not ready".into()));
            }
            Ok(Arc::new(self.clone()))
        }
    }

    #[async_trait]
    impl RemoteApi for MemoryPeer {
        fn collection(&self, name: &str) -> Result<Arc<dyn RemoteCollectionApi>> {
            Ok(Arc::new(MemoryCollection {
                store: self.storage.collection(name)?,
                log: self.log.clone(),
            }))
        }

        async fn activate_data_sharing(&self, token: &str) -> Result<bool> {
            self.activations.lock().expect("activations").push(token.to_string());
            Ok(self.accept_activation.load(Ordering::SeqCst))
        }
    }

    pub struct MemoryCollection {
        store: StoreCollection,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl MemoryCollection {
        fn record(&self, call: String) {
            self.log.lock().expect("log").push(call);
        }

        fn filter(query: &Value) -> Result<Filter> {
            parse_query(query, &Env::new(), &FlatSchema::default())
        }
    }

    #[async_trait]
    impl RemoteCollectionApi for MemoryCollection {
        async fn save(&self, body: Value) -> Result<Vec<Document>> {
            self.record(format!("save {}", body));
            let items = match body {
                Value::Array(items) => items,
                other => vec![other],
            };
            let docs = items
                .into_iter()
                .map(|item| {
                    let mut doc = Document::new();
                    doc.insert("_id".into(), DocId::new().to_value());
                    if let Value::Object(map) = item {
                        doc.extend(map);
                    }
                    doc
                })
                .collect();
            self.store.insert_many(docs)
        }

        async fn update(&self, id: DocId, updates: Vec<UpdateRequest>) -> Result<Vec<UpdateOutcome>> {
            self.record(format!("update {}", id));
            let ops: Vec<UpdateOp> = updates
                .iter()
                .map(|u| UpdateOp::Set {
                    path: u.path.clone(),
                    value: u.value.clone(),
                })
                .collect();
            self.store.update_one(&id, &ops)?;
            Ok(updates
                .into_iter()
                .map(|u| UpdateOutcome {
                    id,
                    kind: crate::update::UpdateKind::Scalar,
                    path: u.path,
                    value: u.value,
                })
                .collect())
        }

        async fn get(&self, id: DocId) -> Result<Option<Document>> {
            self.record(format!("get {}", id));
            self.store.get(&id)
        }

        async fn remove(&self, id: DocId) -> Result<bool> {
            self.record(format!("remove {}", id));
            self.store.delete_one(&id)
        }

        async fn bulk_remove(&self, ids: Vec<DocId>) -> Result<usize> {
            self.record(format!("bulk_remove {}", ids.len()));
            self.store.delete_many(&Filter::id_in(&ids))
        }

        async fn remove_all(&self, query: Value) -> Result<usize> {
            self.record(format!("remove_all {}", query));
            self.store.delete_many(&Self::filter(&query)?)
        }

        async fn search(&self, request: SearchRequest) -> Result<Vec<Document>> {
            self.record(format!("search {}", request.query));
            let options = FindOptions {
                limit: request.limit,
                skip: request.skip,
                sort: parse_sort(&request.sort)?,
                projection: request.project.clone(),
                ..FindOptions::default()
            };
            self.store.find(&Self::filter(&request.query)?, &options)
        }

        async fn get_all(&self) -> Result<Vec<Document>> {
            self.record("get_all".into());
            self.store.find(&Filter::All, &FindOptions::default())
        }

        async fn bulk_get(&self, ids: Vec<DocId>) -> Result<Vec<Document>> {
            self.record(format!("bulk_get {}", ids.len()));
            self.store.find(&Filter::id_in(&ids), &FindOptions::default())
        }

        async fn count(&self, query: Value) -> Result<usize> {
            self.record(format!("count {}", query));
            self.store.count(&Self::filter(&query)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_documents_get_their_store_id_back() {
        let id = DocId::new();
        let doc = json!({"id": id.to_string(), "name": "x"}).as_object().cloned().unwrap();
        let restored = from_peer(doc);
        assert_eq!(restored.get(ID_FIELD), Some(&id.to_value()));
        assert!(!restored.contains_key("id"));

        let stored = json!({"_id": id.to_string(), "id": 3}).as_object().cloned().unwrap();
        assert_eq!(from_peer(stored.clone()), stored);
    }

    #[test]
    fn test_search_request_defaults() {
        let request: SearchRequest = serde_json::from_value(json!({"query": {"a": 1}})).unwrap();
        assert_eq!(request.limit, 0);
        assert!(request.project.is_none());
        assert_eq!(FederationSettings::default().handshake_delay, Duration::from_millis(500));
    }
}
