use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::{DocumentCollection, FindResult, SchemaModel};
use crate::document::{project_exclude, Document};
use crate::error::{DbError, Result};
use crate::federation::{FederationSettings, RemoteCollectionApi, RemoteConnector, RemoteTarget, SearchRequest};
use crate::filter::Filter;
use crate::ids::DocId;
use crate::storage::{sort_to_value, FindOptions};
use crate::update::{UpdateOutcome, UpdateRequest};

enum Handshake {
    Pending,
    Ready(Arc<dyn RemoteCollectionApi>),
    Failed(String),
}

/// Collection whose documents live on a peer instance.
///
/// Construction holds the write side of the gate and spawns the handshake;
/// every operation waits on the read side, so calls issued before the peer
/// is reachable queue up and are released together once it is.
pub struct RemoteCollection {
    model: SchemaModel,
    remote_collection: String,
    gate: Arc<RwLock<Handshake>>,
    max_wait: Duration,
}

impl RemoteCollection {
    pub async fn connect(
        model: SchemaModel,
        target: RemoteTarget,
        remote_collection: impl Into<String>,
        connector: Arc<dyn RemoteConnector>,
        settings: &FederationSettings,
    ) -> Self {
        let remote_collection = remote_collection.into();
        let gate = Arc::new(RwLock::new(Handshake::Pending));
        let mut guard = gate.clone().write_owned().await;

        let key = model.key();
        let name = remote_collection.clone();
        let (delay, limit, retry) = (
            settings.handshake_delay,
            settings.handshake_timeout,
            settings.retry_interval,
        );
        tokio::spawn(async move {
            sleep(delay).await;
            let deadline = Instant::now() + limit;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let connected = match connector.init(&target).await {
                    Ok(api) => api.collection(&name),
                    Err(err) => Err(err),
                };
                match connected {
                    Ok(collection) => {
                        info!(model = %key, endpoint = %target.endpoint, attempt, "Remote collection ready");
                        *guard = Handshake::Ready(collection);
                        break;
                    }
                    Err(err) if Instant::now() + retry < deadline => {
                        debug!(model = %key, attempt, error = %err, "Peer not ready, retrying");
                        sleep(retry).await;
                    }
                    Err(err) => {
                        warn!(model = %key, endpoint = %target.endpoint, attempt, error = %err, "Remote handshake failed");
                        *guard = Handshake::Failed(err.to_string());
                        break;
                    }
                }
            }
        });

        Self {
            model,
            remote_collection,
            gate,
            max_wait: delay + limit + retry,
        }
    }

    pub fn remote_collection(&self) -> &str {
        &self.remote_collection
    }

    async fn remote(&self) -> Result<Arc<dyn RemoteCollectionApi>> {
        let state = timeout(self.max_wait, self.gate.read()).await.map_err(|_| {
            DbError::Federation(format!("handshake for {} timed out", self.model.key()))
        })?;
        match &*state {
            Handshake::Ready(collection) => Ok(collection.clone()),
            Handshake::Failed(reason) => Err(DbError::Federation(format!(
                "{} is unavailable: {}",
                self.model.key(),
                reason
            ))),
            Handshake::Pending => Err(DbError::Federation(format!(
                "handshake for {} never completed",
                self.model.key()
            ))),
        }
    }

    fn search_request(filter: &Filter, options: &FindOptions) -> SearchRequest {
        SearchRequest {
            query: filter.to_query(),
            limit: options.limit,
            skip: options.skip,
            sort: if options.sort.is_empty() {
                Value::Null
            } else {
                sort_to_value(&options.sort)
            },
            project: options.projection.clone(),
        }
    }
}

#[async_trait]
impl DocumentCollection for RemoteCollection {
    fn model(&self) -> &SchemaModel {
        &self.model
    }

    /// The peer applies its own defaults and internal fields.
    async fn add(&self, body: Value, _internals: Document) -> Result<Vec<Document>> {
        self.remote().await?.save(body).await
    }

    async fn update(&self, details: Document, id: DocId) -> Result<Option<Document>> {
        let remote = self.remote().await?;
        let updates = details
            .into_iter()
            .map(|(path, value)| UpdateRequest::new(path, value))
            .collect();
        remote.update(id, updates).await?;
        remote.get(id).await
    }

    async fn exists(&self, id: DocId, extra: Option<&Filter>) -> Result<bool> {
        let Some(doc) = self.remote().await?.get(id).await? else {
            return Ok(false);
        };
        Ok(extra.map_or(true, |f| f.matches(&Value::Object(doc))))
    }

    async fn rm(&self, id: DocId) -> Result<bool> {
        self.remote().await?.remove(id).await
    }

    async fn rm_bulk(&self, ids: &[DocId]) -> Result<usize> {
        self.remote().await?.bulk_remove(ids.to_vec()).await
    }

    async fn rm_all(&self, filter: &Filter) -> Result<usize> {
        self.remote().await?.remove_all(filter.to_query()).await
    }

    async fn find_by_id(&self, id: DocId) -> Result<Option<Document>> {
        self.remote().await?.get(id).await
    }

    async fn find(&self, filter: &Filter, options: FindOptions) -> Result<FindResult> {
        let request = Self::search_request(filter, &options);
        let mut docs = self.remote().await?.search(request).await?;
        if !options.excludes.is_empty() {
            docs = docs.iter().map(|d| project_exclude(d, &options.excludes)).collect();
        }
        if options.stream {
            return Ok(FindResult::Cursor(stream::iter(docs.into_iter().map(Ok)).boxed()));
        }
        Ok(FindResult::Documents(docs))
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>> {
        let options = FindOptions {
            limit: 1,
            ..FindOptions::default()
        };
        let request = Self::search_request(filter, &options);
        Ok(self.remote().await?.search(request).await?.into_iter().next())
    }

    async fn find_all(&self) -> Result<Vec<Document>> {
        self.remote().await?.get_all().await
    }

    async fn find_all_by_id(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        self.remote().await?.bulk_get(ids.to_vec()).await
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        self.remote().await?.count(filter.to_query()).await
    }

    /// Checked against the local view of the schema, then forwarded once per
    /// target document.
    async fn update_by_path(
        &self,
        updates: Vec<UpdateRequest>,
        default_id: Option<DocId>,
    ) -> Result<Vec<UpdateOutcome>> {
        self.model.validate_update(&updates)?;
        let mut grouped: Vec<(DocId, Vec<UpdateRequest>)> = Vec::new();
        for update in updates {
            let id = update.id.or(default_id).ok_or_else(|| {
                DbError::validation("invalid_id", format!("No target id for {}", update.path))
            })?;
            let request = UpdateRequest { id: None, ..update };
            match grouped.iter_mut().find(|(g, _)| *g == id) {
                Some((_, list)) => list.push(request),
                None => grouped.push((id, vec![request])),
            }
        }

        let remote = self.remote().await?;
        let mut outcomes = Vec::new();
        for (id, list) in grouped {
            outcomes.extend(remote.update(id, list).await?);
        }
        Ok(outcomes)
    }
}
