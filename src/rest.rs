//! REST API (Axum) over the registry and the core entity services.
//!
//! Every route except `/health` needs a token, passed as
//! `Authorization: Bearer <value>` or `?token=<value>`. Errors are returned
//! as `{code, message}` with the status of the underlying [`DbError`].
//!
//! Data routes live under `/api/v1/data/:apiPath/:collection` and are also
//! what peers call when they proxy a shared collection to this instance.

use std::sync::Arc;

use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::auth::{bearer_token, check_permission, require_level, require_type};
use crate::collection::AppCollection;
use crate::document::{Document, ID_FIELD};
use crate::entities::{AppService, NewApp, NewDataSharing, PolicySide};
use crate::error::{DbError, Result};
use crate::federation::SearchRequest;
use crate::filter::Filter;
use crate::ids::DocId;
use crate::models::{to_body, App, AuthLevel, Permission, Token, TokenType};
use crate::realtime::{ActivityEvent, Notifier};
use crate::registry::ModelRegistry;
use crate::role;
use crate::schema::{decode_value, encode_value};
use crate::storage::{parse_sort, FindOptions};
use crate::update::UpdateRequest;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(registry: Arc<ModelRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        Self { registry, notifier }
    }
}

/// Handler error carrying a [`DbError`].
#[derive(Debug)]
pub struct ApiError(DbError);

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = %self.0.code(), error = %self.0, "Request failed");
        } else {
            debug!(code = %self.0.code(), error = %self.0, "Request rejected");
        }
        let body = json!({ "code": self.0.code(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Rename internal fields for clients: `_id` becomes `id`, `_app` becomes
/// `appId`, `_user` becomes `userId`; `_token` is dropped.
pub fn prepare_output(doc: Document) -> Value {
    let mut out = Document::new();
    for (key, value) in doc {
        match key.as_str() {
            ID_FIELD => {
                out.insert("id".into(), value);
            }
            "_app" => {
                out.insert("appId".into(), value);
            }
            "_user" => {
                out.insert("userId".into(), value);
            }
            "_token" => {}
            _ => {
                out.insert(key, value);
            }
        }
    }
    Value::Object(out)
}

fn prepare_all(docs: Vec<Document>) -> Vec<Value> {
    docs.into_iter().map(prepare_output).collect()
}

fn prepare_record<T: Serialize>(record: &T) -> Result<Value> {
    match to_body(record)? {
        Value::Object(doc) => Ok(prepare_output(doc)),
        other => Ok(other),
    }
}

#[derive(Deserialize)]
struct TokenParam {
    token: Option<String>,
}

/// The authenticated caller's token.
pub struct Caller(pub Token);

fn no_token() -> DbError {
    DbError::Unauthorized("no valid authentication token".into())
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        let from_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(str::to_string);
        let value = match from_header {
            Some(value) => value,
            None => Query::<TokenParam>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|q| q.0.token)
                .ok_or_else(no_token)?,
        };
        let token = state
            .registry
            .entities()
            .tokens
            .find_by_value(&value)
            .await?
            .ok_or_else(no_token)?;
        Ok(Caller(token))
    }
}

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    let data = Router::new()
        .route("/:api_path/:collection", get(list_docs).post(add_docs))
        .route("/:api_path/:collection/search", post(search_docs))
        .route("/:api_path/:collection/count", post(count_docs))
        .route("/:api_path/:collection/removeAll", post(remove_all_docs))
        .route("/:api_path/:collection/bulk/load", post(add_docs))
        .route("/:api_path/:collection/bulk/get", post(bulk_get_docs))
        .route("/:api_path/:collection/bulk/delete", post(bulk_delete_docs))
        .route(
            "/:api_path/:collection/doc/:id",
            get(get_doc).put(update_doc).delete(remove_doc),
        );

    let api = Router::new()
        .route("/apps", get(list_apps).post(add_app))
        .route("/apps/:id", get(get_app).delete(remove_app))
        .route("/app/schema", get(get_schema).put(put_schema))
        .route("/app/roles", put(put_roles))
        .route("/app/permission", put(put_permission))
        .route("/app/dataSharing", post(add_data_sharing))
        .route("/app/dataSharingPolicy/:id", put(put_data_sharing_policy))
        .route("/app/dataSharing/activate", put(activate_data_sharing))
        .nest("/data", data);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// --- apps ---

async fn list_apps(State(state): State<AppState>, Caller(token): Caller) -> ApiResult<Json<Vec<Value>>> {
    require_level(&token, AuthLevel::Super)?;
    let apps = state.registry.entities().apps.find_all().await?;
    let out = apps.iter().map(prepare_record).collect::<Result<Vec<_>>>()?;
    Ok(Json(out))
}

async fn add_app(
    State(state): State<AppState>,
    Caller(token): Caller,
    Json(body): Json<NewApp>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_level(&token, AuthLevel::Super)?;
    let created = state.registry.entities().apps.add(body).await?;
    state.registry.init_app(&created.app).await?;
    let out = json!({
        "app": prepare_record(&created.app)?,
        "token": prepare_record(&created.token)?,
    });
    Ok((StatusCode::CREATED, Json(out)))
}

async fn get_app(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_level(&token, AuthLevel::Super)?;
    let id = DocId::parse(&id)?;
    let app = state
        .registry
        .entities()
        .apps
        .find_by_id(id)
        .await?
        .ok_or_else(|| unknown_app(&id.to_string()))?;
    Ok(Json(prepare_record(&app)?))
}

async fn remove_app(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<bool>> {
    require_level(&token, AuthLevel::Super)?;
    let removed = state.registry.entities().apps.rm(DocId::parse(&id)?).await?;
    Ok(Json(removed))
}

fn unknown_app(what: &str) -> DbError {
    DbError::not_found("unknown_app", format!("Unknown app {}", what))
}

/// Does `token` act on behalf of `app`? SUPER tokens reach every app;
/// relationship tokens reach the source app of their relationship.
async fn authorize_app(state: &AppState, token: &Token, app: &App) -> Result<()> {
    if token.auth_level >= AuthLevel::Super || token.app == Some(app.id) {
        return Ok(());
    }
    if let Some(id) = token.relationship {
        let relationship = state.registry.entities().relationships.find_by_id(id).await?;
        if relationship.and_then(|r| r.source.app_id) == Some(app.id) {
            return Ok(());
        }
    }
    Err(DbError::Forbidden(format!("token has no access to app {}", app.api_path)))
}

/// The app a token belongs to.
async fn token_app(state: &AppState, token: &Token) -> Result<App> {
    let entities = state.registry.entities();
    let app_id = match (token.app, token.relationship) {
        (Some(app), _) => Some(app),
        (None, Some(relationship)) => entities
            .relationships
            .find_by_id(relationship)
            .await?
            .and_then(|r| r.source.app_id),
        (None, None) => None,
    };
    let app_id = app_id.ok_or_else(|| DbError::Forbidden("token is not bound to an app".into()))?;
    entities
        .apps
        .find_by_id(app_id)
        .await?
        .ok_or_else(|| unknown_app(&app_id.to_string()))
}

// --- app configuration ---

async fn get_schema(State(state): State<AppState>, Caller(token): Caller) -> ApiResult<Json<Value>> {
    require_level(&token, AuthLevel::User)?;
    let app = token_app(&state, &token).await?;
    Ok(Json(encode_value(&AppService::schema_of(&app)?)))
}

async fn put_schema(
    State(state): State<AppState>,
    Caller(token): Caller,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    require_level(&token, AuthLevel::Admin)?;
    let app = token_app(&state, &token).await?;
    let apps = &state.registry.entities().apps;
    let merged = apps.update_schema(app.id, decode_value(&body)?).await?;
    let app = apps
        .find_by_id(app.id)
        .await?
        .ok_or_else(|| unknown_app(&app.id.to_string()))?;
    let models = state.registry.init_app(&app).await?;
    info!(app = %app.id, models = models.len(), "App models refreshed");
    Ok(Json(encode_value(&merged)))
}

async fn put_roles(
    State(state): State<AppState>,
    Caller(token): Caller,
    Json(roles): Json<Value>,
) -> ApiResult<Json<Value>> {
    require_level(&token, AuthLevel::Admin)?;
    if !roles.is_array() {
        return Err(DbError::validation("invalid_roles", "roles must be an array").into());
    }
    let app = token_app(&state, &token).await?;
    state.registry.entities().apps.update_roles(app.id, roles.clone()).await?;
    Ok(Json(roles))
}

async fn put_permission(
    State(state): State<AppState>,
    Caller(token): Caller,
    Json(permission): Json<Permission>,
) -> ApiResult<Json<Value>> {
    require_level(&token, AuthLevel::Admin)?;
    let app = token_app(&state, &token).await?;
    let updated = state
        .registry
        .entities()
        .apps
        .add_or_update_permission(app.id, permission)
        .await?;
    Ok(Json(json!({ "permissions": updated.permissions })))
}

async fn add_data_sharing(
    State(state): State<AppState>,
    Caller(token): Caller,
    Json(body): Json<NewDataSharing>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_level(&token, AuthLevel::Admin)?;
    let app = token_app(&state, &token).await?;
    let registry = &state.registry;
    let sharing = registry
        .entities()
        .data_sharing
        .register(
            app.id,
            body,
            registry.connector().as_ref(),
            registry.settings().allow_unauthorized,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(prepare_record(&sharing)?)))
}

#[derive(Deserialize)]
struct PolicyBody {
    side: PolicySide,
    policy: Value,
}

async fn put_data_sharing_policy(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path(id): Path<String>,
    Json(body): Json<PolicyBody>,
) -> ApiResult<Json<Value>> {
    require_level(&token, AuthLevel::Admin)?;
    let app = token_app(&state, &token).await?;
    let sharing = state
        .registry
        .entities()
        .data_sharing
        .update_policy(app.id, DocId::parse(&id)?, body.side, &body.policy)
        .await?;
    Ok(Json(prepare_record(&sharing)?))
}

#[derive(Deserialize)]
struct ActivateBody {
    #[serde(default)]
    token: Option<String>,
}

/// Called by a peer with the token of our agreement; records the peer's
/// token and activates our side.
async fn activate_data_sharing(
    State(state): State<AppState>,
    Caller(token): Caller,
    Json(body): Json<ActivateBody>,
) -> ApiResult<Json<bool>> {
    require_type(&token, TokenType::DataSharing)?;
    let data_sharing = &state.registry.entities().data_sharing;
    let sharing = data_sharing
        .find_by_token(token.id)
        .await?
        .ok_or_else(|| DbError::not_found("unknown_data_sharing", "No data sharing for this token"))?;
    data_sharing.activate(sharing.id, body.token).await?;
    info!(data_sharing = %sharing.id, "Data sharing activated by peer");
    Ok(Json(true))
}

// --- data ---

/// A resolved data route: the app, its collection model and the caller's
/// role restriction.
struct DataTarget {
    app: App,
    name: String,
    collection: AppCollection,
    role_filter: Filter,
    token: Token,
}

impl DataTarget {
    async fn resolve(
        state: &AppState,
        token: Token,
        api_path: &str,
        name: String,
        permission: &str,
    ) -> Result<Self> {
        let app = state
            .registry
            .entities()
            .apps
            .find_by_api_path(api_path)
            .await?
            .ok_or_else(|| unknown_app(api_path))?;
        authorize_app(state, &token, &app).await?;
        check_permission(&token, &name, permission)?;
        let collection = state.registry.collection(&app, &name).await?;
        let role_filter = role::filter_for(state.registry.as_ref(), &token, &collection).await?;
        Ok(Self {
            app,
            name,
            collection,
            role_filter,
            token,
        })
    }

    /// Request query ANDed with the role restriction.
    fn filter(&self, query: &Value) -> Result<Filter> {
        let requested = if query.is_null() {
            Filter::All
        } else {
            self.collection
                .model()
                .parse_query(query, &role::base_env(&self.token))?
        };
        Ok(requested.and(self.role_filter.clone()))
    }

    /// Whether `id` is visible through the role restriction.
    async fn visible(&self, id: DocId) -> Result<bool> {
        if self.role_filter.is_all() {
            return Ok(true);
        }
        self.collection.exists(id, Some(&self.role_filter)).await
    }
}

fn unknown_document(id: DocId) -> DbError {
    DbError::not_found("invalid_id", format!("Unknown document {}", id))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ListParams {
    query: Option<String>,
    sort: Option<String>,
    limit: usize,
    skip: usize,
}

/// Stream matching documents as one JSON array.
async fn list_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "read").await?;
    let query = match params.query.as_deref() {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };
    let sort = match params.sort.as_deref() {
        Some(raw) => parse_sort(&serde_json::from_str(raw)?)?,
        None => Vec::new(),
    };
    let options = FindOptions {
        limit: params.limit,
        skip: params.skip,
        sort,
        ..FindOptions::streamed()
    };
    let docs = target
        .collection
        .find(&target.filter(&query)?, options)
        .await?
        .into_stream();

    let mut first = true;
    let items = docs.map(move |doc| -> Result<Bytes> {
        let mut chunk = if first { String::new() } else { ",".to_string() };
        first = false;
        chunk.push_str(&serde_json::to_string(&prepare_output(doc?))?);
        Ok(Bytes::from(chunk))
    });
    let body = stream::once(async { Ok::<_, DbError>(Bytes::from_static(b"[")) })
        .chain(items)
        .chain(stream::once(async { Ok::<_, DbError>(Bytes::from_static(b"]")) }));

    Ok(([(header::CONTENT_TYPE, "application/json")], Body::from_stream(body)).into_response())
}

async fn add_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Vec<Value>>)> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "write").await?;
    let report = target.collection.model().validate(&body);
    if !report.is_valid {
        return Err(DbError::validation("invalid_document", report.summary()).into());
    }
    let mut internals = Document::new();
    if let Some(user) = &target.token.user {
        internals.insert("_user".into(), Value::String(user.clone()));
    }
    let docs = target.collection.add(body, internals).await?;
    debug!(app = %target.app.id, collection = %target.name, count = docs.len(), "Documents added");
    Ok((StatusCode::CREATED, Json(prepare_all(docs))))
}

async fn search_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<Vec<Value>>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "read").await?;
    let options = FindOptions {
        limit: request.limit,
        skip: request.skip,
        sort: parse_sort(&request.sort)?,
        projection: request.project,
        ..FindOptions::default()
    };
    let docs = target
        .collection
        .find(&target.filter(&request.query)?, options)
        .await?
        .collect()
        .await?;
    Ok(Json(prepare_all(docs)))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct QueryBody {
    query: Value,
}

async fn count_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Json(body): Json<QueryBody>,
) -> ApiResult<Json<usize>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "read").await?;
    Ok(Json(target.collection.count(&target.filter(&body.query)?).await?))
}

async fn remove_all_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Json(body): Json<QueryBody>,
) -> ApiResult<Json<usize>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "write").await?;
    Ok(Json(target.collection.rm_all(&target.filter(&body.query)?).await?))
}

async fn bulk_get_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Json(ids): Json<Vec<DocId>>,
) -> ApiResult<Json<Vec<Value>>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "read").await?;
    let docs = if target.role_filter.is_all() {
        target.collection.find_all_by_id(&ids).await?
    } else {
        let filter = Filter::id_in(&ids).and(target.role_filter.clone());
        target.collection.find(&filter, FindOptions::default()).await?.collect().await?
    };
    Ok(Json(prepare_all(docs)))
}

async fn bulk_delete_docs(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name)): Path<(String, String)>,
    Json(ids): Json<Vec<DocId>>,
) -> ApiResult<Json<usize>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "write").await?;
    let removed = if target.role_filter.is_all() {
        target.collection.rm_bulk(&ids).await?
    } else {
        let filter = Filter::id_in(&ids).and(target.role_filter.clone());
        target.collection.rm_all(&filter).await?
    };
    Ok(Json(removed))
}

async fn get_doc(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name, id)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "read").await?;
    let id = DocId::parse(&id)?;
    let doc = if target.role_filter.is_all() {
        target.collection.find_by_id(id).await?
    } else {
        let filter = Filter::id_eq(id).and(target.role_filter.clone());
        target.collection.find_one(&filter).await?
    };
    let doc = doc.ok_or_else(|| unknown_document(id))?;
    Ok(Json(prepare_output(doc)))
}

/// Apply a path-update list to one document and announce every applied
/// update.
async fn update_doc(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name, id)): Path<(String, String, String)>,
    Json(updates): Json<Vec<UpdateRequest>>,
) -> ApiResult<Json<Value>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "write").await?;
    let id = DocId::parse(&id)?;
    if !target.visible(id).await? {
        return Err(unknown_document(id).into());
    }
    let outcomes = target.collection.update_by_path(updates, Some(id)).await?;
    for outcome in &outcomes {
        let event = ActivityEvent::new(
            target.app.api_path.clone(),
            format!("{}:update", target.name),
            "put",
        )
        .with_params(serde_json::to_value(outcome)?);
        let event = match &target.token.role {
            Some(role) => event.for_role(role.clone()),
            None => event,
        };
        state.notifier.notify(event);
    }
    Ok(Json(serde_json::to_value(&outcomes)?))
}

async fn remove_doc(
    State(state): State<AppState>,
    Caller(token): Caller,
    Path((api_path, name, id)): Path<(String, String, String)>,
) -> ApiResult<Json<bool>> {
    let target = DataTarget::resolve(&state, token, &api_path, name, "write").await?;
    let id = DocId::parse(&id)?;
    if !target.visible(id).await? {
        return Ok(Json(false));
    }
    Ok(Json(target.collection.rm(id).await?))
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError(DbError::from(err))
    }
}
