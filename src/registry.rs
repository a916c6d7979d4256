//! Model registry: which collection model serves which app collection.
//!
//! Core entity models are created once at startup under their fixed
//! collection names. App collections are built from each app's stored schema
//! on first use and cached for the life of the process under
//! `<appShortId>-<collection>`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collection::{
    AppCollection, DocumentCollection, LocalCollection, RemoteCollection, SchemaModel, SplitCollection,
};
use crate::entities::{AppService, CoreModels, Entities};
use crate::error::{DbError, Result};
use crate::federation::{FederationSettings, RemoteConnector, RemoteTarget};
use crate::ids::short_id;
use crate::models::App;
use crate::realtime::Notifier;
use crate::schema::{build_collections, CollectionSchema, RemoteRef};
use crate::storage::Storage;

/// Read access to registered models by key.
pub trait ModelLookup: Send + Sync {
    fn lookup(&self, key: &str) -> Option<AppCollection>;
}

impl ModelLookup for HashMap<String, AppCollection> {
    fn lookup(&self, key: &str) -> Option<AppCollection> {
        self.get(key).cloned()
    }
}

pub struct ModelRegistry {
    storage: Storage,
    core: CoreModels,
    entities: Entities,
    connector: Arc<dyn RemoteConnector>,
    settings: FederationSettings,
    models: RwLock<HashMap<String, AppCollection>>,
    /// Serialises model construction so concurrent first use of a key
    /// builds it once.
    build_lock: Mutex<()>,
}

impl ModelRegistry {
    /// Create the registry with its core models.
    pub fn new(
        storage: Storage,
        connector: Arc<dyn RemoteConnector>,
        settings: FederationSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let core = CoreModels::init(&storage)?;
        let entities = Entities::new(&core, notifier)?;
        let models = core
            .iter()
            .map(|(_, model)| (model.model().key(), AppCollection::Local(model.clone())))
            .collect();
        Ok(Self {
            storage,
            core,
            entities,
            connector,
            settings,
            models: RwLock::new(models),
            build_lock: Mutex::new(()),
        })
    }

    pub fn core(&self) -> &CoreModels {
        &self.core
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn connector(&self) -> &Arc<dyn RemoteConnector> {
        &self.connector
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.settings
    }

    pub fn get(&self, key: &str) -> Option<AppCollection> {
        self.models.read().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .models
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn insert(&self, key: String, model: AppCollection) -> Result<()> {
        let mut models = self
            .models
            .write()
            .map_err(|_| DbError::Config("model registry lock poisoned".into()))?;
        models.insert(key, model);
        Ok(())
    }

    /// Build models for every stored app.
    pub async fn init_schema(&self) -> Result<usize> {
        let apps = self.entities.apps.find_all().await?;
        let mut total = 0;
        for app in &apps {
            total += self.init_app(app).await?.len();
        }
        info!(apps = apps.len(), models = total, "App schemas loaded");
        Ok(total)
    }

    /// Build (or rebuild, when its schema changed) every collection of one
    /// app. Returns the keys now served for the app.
    pub async fn init_app(&self, app: &App) -> Result<Vec<String>> {
        let descriptions = AppService::schema_of(app)?;
        let mut keys = Vec::new();
        for schema in build_collections(&descriptions) {
            if let Some(model) = self.model_for(app, schema).await? {
                keys.push(model.model().key());
            }
        }
        Ok(keys)
    }

    /// Cached model for an app collection, building it on first use. `None`
    /// when the collection is federated and its agreement cannot be found.
    pub async fn model_for(&self, app: &App, schema: CollectionSchema) -> Result<Option<AppCollection>> {
        let short = short_id(&app.id);
        let key = crate::collection::model_key(Some(&short), &schema.collection);
        if let Some(existing) = self.get(&key) {
            if *existing.model().schema == schema {
                return Ok(Some(existing));
            }
        }

        let _guard = self.build_lock.lock().await;
        if let Some(existing) = self.get(&key) {
            if *existing.model().schema == schema {
                return Ok(Some(existing));
            }
        }

        let Some(model) = self.build(app, &short, schema).await? else {
            return Ok(None);
        };
        debug!(model = %key, kind = model.kind(), "Model built");
        self.insert(key, model.clone())?;
        Ok(Some(model))
    }

    /// Model of `collection` for `app`, building it from the app's schema if
    /// needed.
    pub async fn collection(&self, app: &App, collection: &str) -> Result<AppCollection> {
        let key = crate::collection::model_key(Some(&short_id(&app.id)), collection);
        if let Some(model) = self.get(&key) {
            return Ok(model);
        }
        let schema = build_collections(&AppService::schema_of(app)?)
            .into_iter()
            .find(|s| s.collection == collection)
            .ok_or_else(|| unknown_collection(collection))?;
        self.model_for(app, schema)
            .await?
            .ok_or_else(|| unknown_collection(collection))
    }

    async fn build(&self, app: &App, short: &str, schema: CollectionSchema) -> Result<Option<AppCollection>> {
        if let Some(descriptor) = schema.remote.clone() {
            return self.build_shared(app, short, schema, &descriptor).await;
        }
        if let Some(name) = schema.relationship.clone() {
            return self.build_related(app, short, schema, &name).await;
        }
        let model = SchemaModel::new(schema, Some(short.to_string()))?;
        let store = self.storage.collection(&model.key())?;
        Ok(Some(AppCollection::Local(Arc::new(LocalCollection::new(model, store)))))
    }

    async fn build_shared(
        &self,
        app: &App,
        short: &str,
        schema: CollectionSchema,
        descriptor: &str,
    ) -> Result<Option<AppCollection>> {
        let remote = match RemoteRef::parse(descriptor) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(app = %app.id, collection = %schema.collection, error = %err, "Skipping collection");
                return Ok(None);
            }
        };
        let Some(sharing) = self.entities.data_sharing.find_by_name(app.id, &remote.agreement).await? else {
            warn!(
                app = %app.id,
                collection = %schema.collection,
                data_sharing = %remote.agreement,
                "No data sharing agreement for remote collection, skipping"
            );
            return Ok(None);
        };
        let (Some(endpoint), Some(api_path), Some(token)) = (
            sharing.remote_app.endpoint.clone(),
            sharing.remote_app.api_path.clone(),
            sharing.remote_app.token.clone(),
        ) else {
            warn!(app = %app.id, data_sharing = %sharing.name, "Data sharing has no remote app details, skipping");
            return Ok(None);
        };

        let model = SchemaModel::new(schema, Some(short.to_string()))?;
        let store = self.storage.collection(&model.key())?;
        let local = LocalCollection::new(model.clone(), store);
        let target = RemoteTarget {
            endpoint,
            api_path,
            token,
            allow_unauthorized: self.settings.allow_unauthorized,
        };
        let remote =
            RemoteCollection::connect(model, target, remote.collection, self.connector.clone(), &self.settings).await;
        Ok(Some(AppCollection::Split(Arc::new(SplitCollection::new(local, remote)))))
    }

    async fn build_related(
        &self,
        app: &App,
        short: &str,
        schema: CollectionSchema,
        descriptor: &str,
    ) -> Result<Option<AppCollection>> {
        // `<relationship>.<collection>`, or a bare relationship name serving
        // the collection of the same name.
        let (name, remote_collection) = if descriptor.contains('.') {
            match RemoteRef::parse(descriptor) {
                Ok(remote) => (remote.agreement, remote.collection),
                Err(err) => {
                    warn!(app = %app.id, collection = %schema.collection, error = %err, "Skipping collection");
                    return Ok(None);
                }
            }
        } else {
            (descriptor.to_string(), schema.collection.clone())
        };
        let Some(relationship) = self.entities.relationships.find_destination(&name, app.id).await? else {
            warn!(app = %app.id, collection = %schema.collection, relationship = %name, "No relationship for collection, skipping");
            return Ok(None);
        };
        let (Some(endpoint), Some(api_path), Some(token)) = (
            relationship.source.endpoint.clone(),
            relationship.source.api_path.clone(),
            relationship.destination.source_token.clone(),
        ) else {
            warn!(app = %app.id, relationship = %name, "Relationship is missing source details, skipping");
            return Ok(None);
        };

        let model = SchemaModel::new(schema, Some(short.to_string()))?;
        let target = RemoteTarget {
            endpoint,
            api_path,
            token,
            allow_unauthorized: self.settings.allow_unauthorized,
        };
        let remote =
            RemoteCollection::connect(model, target, remote_collection, self.connector.clone(), &self.settings).await;
        Ok(Some(AppCollection::Remote(Arc::new(remote))))
    }
}

impl ModelLookup for ModelRegistry {
    fn lookup(&self, key: &str) -> Option<AppCollection> {
        self.get(key)
    }
}

fn unknown_collection(name: &str) -> DbError {
    DbError::not_found("unknown_collection", format!("Unknown collection {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NewApp, NewDataSharing, NewRelationship};
    use crate::federation::memory::MemoryPeer;
    use crate::ids::DocId;
    use crate::models::{RelationshipSide, RelationshipType, RemoteApp};
    use crate::realtime::LogNotifier;
    use crate::schema::decode_value;
    use serde_json::json;

    fn registry(peer: &MemoryPeer) -> ModelRegistry {
        ModelRegistry::new(
            Storage::temporary().unwrap(),
            Arc::new(peer.clone()),
            FederationSettings::default(),
            Arc::new(LogNotifier),
        )
        .unwrap()
    }

    async fn app_with_schema(registry: &ModelRegistry, schema: serde_json::Value) -> App {
        let created = registry
            .entities()
            .apps
            .add(serde_json::from_value::<NewApp>(json!({"name": "Acme", "authLevel": 2})).unwrap())
            .await
            .unwrap();
        registry
            .entities()
            .apps
            .update_schema(created.app.id, decode_value(&schema).unwrap())
            .await
            .unwrap();
        registry.entities().apps.find_by_id(created.app.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_core_models_and_app_keys() {
        let peer = MemoryPeer::new();
        let registry = registry(&peer);
        for key in ["apps", "tokens", "appDataSharing", "appRelationships"] {
            assert!(registry.get(key).is_some(), "{}", key);
        }

        let app = app_with_schema(
            &registry,
            json!([
                {"name": "orders", "properties": {"total": {"__type": "number"}}},
                {"name": "base", "type": "schema", "properties": {"x": {"__type": "string"}}}
            ]),
        )
        .await;
        let keys = registry.init_app(&app).await.unwrap();
        let short = short_id(&app.id);
        assert_eq!(keys, vec![format!("{}-orders", short)]);

        let first = registry.collection(&app, "orders").await.unwrap();
        let second = registry.collection(&app, "orders").await.unwrap();
        match (&first, &second) {
            (AppCollection::Local(a), AppCollection::Local(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected local models"),
        }
        assert_eq!(registry.collection(&app, "base").await.unwrap_err().code(), "unknown_collection");
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_once() {
        let peer = MemoryPeer::new();
        let registry = Arc::new(registry(&peer));
        let app = app_with_schema(&registry, json!([{"name": "orders", "properties": {}}])).await;

        let (a, b) = tokio::join!(registry.collection(&app, "orders"), registry.collection(&app, "orders"));
        match (a.unwrap(), b.unwrap()) {
            (AppCollection::Local(a), AppCollection::Local(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected local models"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_collections_need_an_agreement() {
        let peer = MemoryPeer::new();
        let registry = registry(&peer);
        let app = app_with_schema(
            &registry,
            json!([
                {"name": "local", "properties": {}},
                {"name": "shared", "remote": "partner.people", "properties": {"name": {"__type": "string"}}},
                {"name": "linked", "$relationship": "link", "properties": {}}
            ]),
        )
        .await;

        let keys = registry.init_app(&app).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(registry.collection(&app, "shared").await.is_err());

        registry
            .entities()
            .data_sharing
            .add(
                app.id,
                NewDataSharing {
                    name: "partner".into(),
                    remote_app: RemoteApp {
                        endpoint: Some("http://peer.test".into()),
                        api_path: Some("peer".into()),
                        token: Some("peer-token".into()),
                    },
                },
            )
            .await
            .unwrap();
        registry
            .entities()
            .relationships
            .add(NewRelationship {
                name: "link".into(),
                kind: RelationshipType::Destination,
                source: RelationshipSide {
                    app_id: Some(DocId::new()),
                    endpoint: Some("http://source.test".into()),
                    api_path: Some("src".into()),
                    ..RelationshipSide::default()
                },
                destination: RelationshipSide {
                    app_id: Some(app.id),
                    source_token: Some("rel-token".into()),
                    ..RelationshipSide::default()
                },
            })
            .await
            .unwrap();

        assert_eq!(registry.init_app(&app).await.unwrap().len(), 3);
        let shared = registry.collection(&app, "shared").await.unwrap();
        assert_eq!(shared.kind(), "split");
        let linked = registry.collection(&app, "linked").await.unwrap();
        assert_eq!(linked.kind(), "remote");

        shared.add(json!({"name": "via peer"}), Default::default()).await.unwrap();
        assert_eq!(peer.storage.collection("people").unwrap().count(&crate::filter::Filter::All).unwrap(), 1);
        linked.count(&crate::filter::Filter::All).await.unwrap();
        let tokens: Vec<String> = peer.targets.lock().unwrap().iter().map(|t| t.token.clone()).collect();
        assert!(tokens.contains(&"peer-token".to_string()));
        assert!(tokens.contains(&"rel-token".to_string()));
    }

    #[tokio::test]
    async fn test_init_schema_loads_every_app() {
        let peer = MemoryPeer::new();
        let registry = registry(&peer);
        app_with_schema(&registry, json!([{"name": "a", "properties": {}}, {"name": "b", "properties": {}}])).await;
        assert_eq!(registry.init_schema().await.unwrap(), 2);
        assert_eq!(registry.keys().len(), 6);
    }
}
