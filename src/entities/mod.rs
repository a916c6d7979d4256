//! Core platform entities: apps, their tokens, data-sharing agreements and
//! relationships.
//!
//! Their schemas are authored in the same description language apps use and
//! run through the same collection machinery, in fixed app-agnostic
//! collections.

mod app;
mod data_sharing;
mod relationship;
mod token;

pub use app::{AppService, AppWithToken, NewApp};
pub use data_sharing::{DataSharingService, NewDataSharing, PolicySide};
pub use relationship::{NewRelationship, RelationshipService};
pub use token::{NewToken, TokenLinks, TokenService};

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::collection::{LocalCollection, SchemaModel};
use crate::error::Result;
use crate::realtime::Notifier;
use crate::schema::{build_collections, decode_value, CollectionSchema};
use crate::storage::Storage;

pub const APPS: &str = "apps";
pub const TOKENS: &str = "tokens";
pub const DATA_SHARING: &str = "appDataSharing";
pub const RELATIONSHIPS: &str = "appRelationships";

fn describe() -> Value {
    json!([
        {
            "name": "app",
            "collection": APPS,
            "properties": {
                "name": {"__type": "string", "__default": "", "__allowUpdate": true},
                "type": {"__type": "string", "__enum": ["server", "ios", "android", "browser"], "__default": "server"},
                "apiPath": {"__type": "string", "__default": "", "__allowUpdate": true},
                "_token": {"__type": "id", "__required": true},
                "__schema": {"__type": "string", "__required": true, "__default": "[]", "__allowUpdate": true},
                "__roles": {"__type": "array", "__allowUpdate": true}
            }
        },
        {
            "name": "token",
            "collection": TOKENS,
            "properties": {
                "value": {"__type": "string", "__required": true},
                "type": {"__type": "string", "__enum": ["app", "user", "dataSharing", "relationship"], "__required": true},
                "authLevel": {"__type": "number", "__enum": [0, 1, 2, 3], "__default": 0},
                "permissions": {"__type": "array", "__allowUpdate": true, "__schema": {
                    "route": {"__type": "string", "__required": true, "__allowUpdate": true},
                    "permission": {"__type": "string", "__required": true, "__allowUpdate": true}
                }},
                "role": {"__type": "string", "__default": null, "__allowUpdate": true},
                "_app": {"__type": "id", "__default": null},
                "_user": {"__type": "string", "__default": null},
                "_appDataSharingId": {"__type": "id", "__default": null},
                "_relationshipId": {"__type": "id", "__default": null}
            }
        },
        {
            "name": "appDataSharing",
            "collection": DATA_SHARING,
            "properties": {
                "name": {"__type": "string", "__required": true},
                "remoteApp": {
                    "endpoint": {"__type": "string", "__default": null, "__required": true, "__allowUpdate": true},
                    "apiPath": {"__type": "string", "__default": null, "__required": true, "__allowUpdate": true},
                    "token": {"__type": "string", "__default": null, "__allowUpdate": true}
                },
                "dataSharing": {
                    "localApp": {"__type": "string", "__default": null, "__allowUpdate": true},
                    "remoteApp": {"__type": "string", "__default": null, "__allowUpdate": true}
                },
                "active": {"__type": "boolean", "__default": false, "__allowUpdate": true},
                "_appId": {"__type": "id", "__default": null},
                "_tokenId": {"__type": "id", "__default": null}
            }
        },
        {
            "name": "appRelationship",
            "collection": RELATIONSHIPS,
            "properties": {
                "name": {"__type": "string", "__required": true},
                "type": {"__type": "string", "__enum": ["source", "destination"], "__required": true},
                "source": {
                    "appId": {"__type": "id", "__required": true},
                    "endpoint": {"__type": "string", "__default": null, "__allowUpdate": true},
                    "apiPath": {"__type": "string", "__default": null, "__allowUpdate": true},
                    "policy": {"__type": "string", "__default": null, "__allowUpdate": true}
                },
                "destination": {
                    "appId": {"__type": "id", "__required": true},
                    "endpoint": {"__type": "string", "__default": null, "__allowUpdate": true},
                    "apiPath": {"__type": "string", "__default": null, "__allowUpdate": true},
                    "policy": {"__type": "string", "__default": null, "__allowUpdate": true},
                    "sourceToken": {"__type": "string", "__default": null, "__allowUpdate": true}
                },
                "_tokenId": {"__type": "id", "__default": null}
            }
        }
    ])
}

/// Collection schemas of the core entities.
pub fn core_schemas() -> Result<Vec<CollectionSchema>> {
    Ok(build_collections(&decode_value(&describe())?))
}

/// `appDataSharing` -> `AppDataSharing`.
pub fn model_name(schema_name: &str) -> String {
    let mut chars = schema_name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// One singleton model per core entity, addressable by entity name.
#[derive(Clone)]
pub struct CoreModels {
    models: Vec<(String, Arc<LocalCollection>)>,
}

impl CoreModels {
    pub fn init(storage: &Storage) -> Result<Self> {
        let mut models = Vec::new();
        for schema in core_schemas()? {
            let name = model_name(&schema.name);
            let model = SchemaModel::new(schema, None)?;
            let store = storage.collection(&model.key())?;
            info!(model = %name, collection = %model.key(), "Core model ready");
            models.push((name, Arc::new(LocalCollection::new(model, store))));
        }
        Ok(Self { models })
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<LocalCollection>> {
        self.models
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<LocalCollection>)> {
        self.models.iter().map(|(n, m)| (n.as_str(), m))
    }

    fn require(&self, name: &str) -> Result<Arc<LocalCollection>> {
        self.by_name(name)
            .ok_or_else(|| crate::error::DbError::Config(format!("core model {} is missing", name)))
    }
}

/// Services over the core models.
#[derive(Clone)]
pub struct Entities {
    pub tokens: TokenService,
    pub apps: AppService,
    pub data_sharing: DataSharingService,
    pub relationships: RelationshipService,
}

impl Entities {
    pub fn new(core: &CoreModels, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let tokens = TokenService::new(core.require("Token")?);
        Ok(Self {
            apps: AppService::new(core.require("App")?, tokens.clone(), notifier),
            data_sharing: DataSharingService::new(core.require("AppDataSharing")?, tokens.clone()),
            relationships: RelationshipService::new(core.require("AppRelationship")?, tokens.clone()),
            tokens,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::realtime::ChannelNotifier;

    pub struct Fixture {
        pub storage: Storage,
        pub core: CoreModels,
        pub entities: Entities,
        pub notifier: ChannelNotifier,
    }

    pub fn fixture() -> Fixture {
        let storage = Storage::temporary().unwrap();
        let core = CoreModels::init(&storage).unwrap();
        let notifier = ChannelNotifier::new(16);
        let entities = Entities::new(&core, Arc::new(notifier.clone())).unwrap();
        Fixture {
            storage,
            core,
            entities,
            notifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::DocumentCollection;

    #[test]
    fn test_core_models_by_name() {
        let storage = Storage::temporary().unwrap();
        let core = CoreModels::init(&storage).unwrap();
        let names: Vec<&str> = core.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["App", "Token", "AppDataSharing", "AppRelationship"]);
        assert_eq!(core.by_name("AppDataSharing").unwrap().model().key(), DATA_SHARING);
        assert_eq!(core.by_name("App").unwrap().model().key(), APPS);
        assert!(core.by_name("Nope").is_none());
        assert_eq!(model_name("appRelationship"), "AppRelationship");
    }
}
