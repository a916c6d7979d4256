use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::token::{NewToken, TokenLinks, TokenService};
use crate::collection::{DocumentCollection, LocalCollection, SchemaModel};
use crate::document::Document;
use crate::error::{DbError, Result};
use crate::ids::{short_id, DocId};
use crate::models::{from_document, App, AuthLevel, Permission, Token, TokenType};
use crate::realtime::{ActivityEvent, Notifier};
use crate::schema::{build_collections, decode, encode, SchemaDescription};

/// Body of an app registration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApp {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub api_path: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AppWithToken {
    pub app: App,
    pub token: Token,
}

#[derive(Clone)]
pub struct AppService {
    collection: Arc<LocalCollection>,
    tokens: TokenService,
    notifier: Arc<dyn Notifier>,
    local_schema: Arc<RwLock<Vec<SchemaDescription>>>,
    add_lock: Arc<Mutex<()>>,
}

/// Attempts at drawing an app id whose short id is still free.
const MAX_ID_ATTEMPTS: usize = 32;

/// Draw ids until one has a short id outside `taken`. App collections are
/// namespaced by short id, so two apps must never share one.
fn unused_id(taken: &HashSet<String>, mut next: impl FnMut() -> DocId) -> Result<DocId> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = next();
        let short = short_id(&id);
        if !taken.contains(&short) {
            return Ok(id);
        }
        debug!(short = %short, "App short id taken, drawing another");
    }
    Err(DbError::Config(format!(
        "no free app short id after {} attempts",
        MAX_ID_ATTEMPTS
    )))
}

fn unknown_app(id: DocId) -> DbError {
    DbError::not_found("invalid_id", format!("Unknown app {}", id))
}

impl AppService {
    pub fn new(collection: Arc<LocalCollection>, tokens: TokenService, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            collection,
            tokens,
            notifier,
            local_schema: Arc::default(),
            add_lock: Arc::default(),
        }
    }

    /// Schema definitions owned by this process, merged into every schema
    /// update.
    pub fn set_local_schema(&self, schema: Vec<SchemaDescription>) {
        if let Ok(mut local) = self.local_schema.write() {
            *local = schema;
        }
    }

    fn local_schema(&self) -> Vec<SchemaDescription> {
        self.local_schema.read().map(|l| l.clone()).unwrap_or_default()
    }

    /// Create the app's token, then the app. If the app cannot be stored the
    /// token is removed again. Adds are serialised so the short id and api
    /// path checks cannot race.
    pub async fn add(&self, body: NewApp) -> Result<AppWithToken> {
        let _guard = self.add_lock.lock().await;
        let taken: HashSet<String> = self.find_all().await?.iter().map(|app| short_id(&app.id)).collect();
        let id = unused_id(&taken, DocId::new)?;
        let api_path = body
            .api_path
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| short_id(&id));
        if self.find_by_api_path(&api_path).await?.is_some() {
            return Err(DbError::validation(
                "duplicate_api_path",
                format!("An app already uses the api path {}", api_path),
            ));
        }

        let token = self
            .tokens
            .mint(
                NewToken::new(TokenType::App, body.auth_level).with_permissions(body.permissions),
                TokenLinks {
                    app: Some(id),
                    ..TokenLinks::default()
                },
            )
            .await?;

        let doc = json!({
            "_id": id.to_string(),
            "name": body.name,
            "type": body.kind,
            "apiPath": api_path,
            "_token": token.id.to_string(),
        });
        let report = self.collection.model().validate(&doc);
        let stored = if !report.is_valid {
            Err(DbError::validation("invalid_app", report.summary()))
        } else {
            match self.collection.add(doc, Document::new()).await {
                Ok(mut stored) => stored
                    .pop()
                    .ok_or_else(|| DbError::Config("app insert returned nothing".into())),
                Err(err) => Err(err),
            }
        };
        let app: App = match stored.and_then(from_document) {
            Ok(app) => app,
            Err(err) => {
                self.tokens.compensate(&token, &err).await;
                return Err(err);
            }
        };

        info!(app = %app.id, api_path = %app.api_path, "App added");
        self.notifier
            .notify(ActivityEvent::new("", "app-routes:bust-cache", "post").for_super());
        Ok(AppWithToken { app, token })
    }

    pub async fn find_all(&self) -> Result<Vec<App>> {
        self.collection
            .find_all()
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    pub async fn find_by_id(&self, id: DocId) -> Result<Option<App>> {
        self.collection.find_by_id(id).await?.map(from_document).transpose()
    }

    pub async fn find_by_api_path(&self, api_path: &str) -> Result<Option<App>> {
        let filter = self
            .collection
            .model()
            .parse_query(&json!({ "apiPath": api_path }), &Default::default())?;
        self.collection.find_one(&filter).await?.map(from_document).transpose()
    }

    /// Remove the app and its primary token.
    pub async fn rm(&self, id: DocId) -> Result<bool> {
        let app = self.find_by_id(id).await?.ok_or_else(|| unknown_app(id))?;
        if let Some(token) = app.token {
            self.tokens.rm(token).await?;
        }
        let removed = self.collection.rm(id).await?;
        info!(app = %id, "App removed");
        Ok(removed)
    }

    /// Merge the process-local schema onto `incoming` and persist it.
    ///
    /// Local collections missing from `incoming` are kept as they are; for
    /// collections present in both, local property definitions are laid over
    /// the incoming ones. The merged list must build into valid collections.
    pub async fn update_schema(&self, id: DocId, mut incoming: Vec<SchemaDescription>) -> Result<Vec<SchemaDescription>> {
        let app = self.find_by_id(id).await?.ok_or_else(|| unknown_app(id))?;
        for local in self.local_schema() {
            match incoming.iter_mut().find(|s| s.name == local.name) {
                Some(schema) => schema.properties.merge_from(&local.properties),
                None => incoming.push(local),
            }
        }

        for schema in build_collections(&incoming) {
            SchemaModel::new(schema, None)?;
        }

        let encoded = encode(&incoming);
        let mut details = Document::new();
        details.insert("__schema".into(), Value::String(encoded));
        self.collection
            .update(details, id)
            .await?
            .ok_or_else(|| unknown_app(id))?;

        info!(app = %id, collections = incoming.len(), "App schema updated");
        self.notifier.notify(
            ActivityEvent::new(app.api_path.clone(), "app-schema:updated", "put")
                .with_params(json!({ "appId": id.to_string() }))
                .for_super(),
        );
        Ok(incoming)
    }

    /// Decoded schema of an app.
    pub fn schema_of(app: &App) -> Result<Vec<SchemaDescription>> {
        decode(&app.schema)
    }

    pub async fn update_roles(&self, id: DocId, roles: Value) -> Result<()> {
        let mut details = Document::new();
        details.insert("__roles".into(), roles);
        self.collection
            .update(details, id)
            .await?
            .ok_or_else(|| unknown_app(id))?;
        Ok(())
    }

    /// Forward a permission change to the app's primary token.
    pub async fn add_or_update_permission(&self, id: DocId, permission: Permission) -> Result<Token> {
        let app = self.find_by_id(id).await?.ok_or_else(|| unknown_app(id))?;
        let token = app
            .token
            .ok_or_else(|| DbError::Unauthorized("no valid authentication token".into()))?;
        self.tokens.add_or_update_permission(token, permission).await
    }
}
