//! Role filter resolution.
//!
//! A collection schema may restrict what a role sees with an `authFilter`:
//!
//! ```text
//! "roles": [{"name": "customer", "authFilter": {
//!     "env":   {"allowedIds": {"schema.orders.customerId": {"$gt": 0}, "map": "customerId"}},
//!     "query": {"customerId": {"$in": "env.allowedIds"}}
//! }}]
//! ```
//!
//! Each `env` entry runs a lookup against another collection of the same app
//! and binds the collected values to a name. Entries run in declaration order
//! and every entry sees the bindings made before it. The final `query` is
//! then parsed against the target collection with the full environment.

use serde_json::Value;
use tracing::debug;

use crate::collection::{model_key, AppCollection, AuthFilter, SchemaModel};
use crate::document::get_path;
use crate::error::{DbError, Result};
use crate::filter::Filter;
use crate::models::Token;
use crate::query::Env;
use crate::registry::ModelLookup;
use crate::storage::FindOptions;

const SCHEMA_PREFIX: &str = "schema.";

/// Variables every resolution starts with.
pub fn base_env(token: &Token) -> Env {
    let mut env = Env::new();
    env.insert(
        "authUserId".into(),
        token.user.clone().map_or(Value::Null, Value::String),
    );
    env
}

/// Run the `env` lookups of `filter` in order.
pub async fn resolve_env(
    models: &dyn ModelLookup,
    token: &Token,
    app_short_id: &str,
    filter: &AuthFilter,
) -> Result<Env> {
    let mut env = base_env(token);
    for (name, entry) in &filter.env {
        let Value::Object(entry) = entry else {
            return Err(DbError::Config(format!("authFilter env {} must be an object", name)));
        };
        let map = entry.get("map").and_then(Value::as_str);

        let mut values = Vec::new();
        for (command, fragment) in entry {
            let Some(path) = command.strip_prefix(SCHEMA_PREFIX) else {
                if command != "map" {
                    debug!(env = %name, key = %command, "Ignoring authFilter env key");
                }
                continue;
            };
            let Some((collection, field)) = path.split_once('.') else {
                return Err(DbError::Config(format!("authFilter env {} has no field in {}", name, command)));
            };

            let key = model_key(Some(app_short_id), collection);
            let source = models.lookup(&key).ok_or_else(|| {
                DbError::Config(format!("authFilter env {} references unknown collection {}", name, collection))
            })?;
            let property = map.unwrap_or(field);

            let mut query = serde_json::Map::new();
            query.insert(field.to_string(), fragment.clone());
            let parsed = source.model().parse_query(&Value::Object(query), &env)?;
            let options = FindOptions {
                projection: Some(vec![property.to_string()]),
                ..FindOptions::default()
            };
            let docs = source.find(&parsed, options).await?.collect().await?;

            values.clear();
            for doc in docs {
                match get_path(&Value::Object(doc), property).cloned() {
                    Some(Value::Array(items)) => values.extend(items.into_iter().filter(|v| !v.is_null())),
                    Some(Value::Null) | None => {}
                    Some(value) => values.push(value),
                }
            }
        }
        debug!(env = %name, values = values.len(), "authFilter env resolved");
        env.insert(name.clone(), Value::Array(values));
    }
    Ok(env)
}

/// Resolve `filter` for `token` into a filter over `target`.
pub async fn resolve(
    models: &dyn ModelLookup,
    token: &Token,
    app_short_id: &str,
    filter: &AuthFilter,
    target: &SchemaModel,
) -> Result<Filter> {
    let env = resolve_env(models, token, app_short_id, filter).await?;
    if filter.query.is_null() {
        return Ok(Filter::All);
    }
    target.parse_query(&filter.query, &env)
}

/// Row filter a token's role imposes on `collection`. Tokens without a role,
/// and roles the collection does not restrict, see everything.
pub async fn filter_for(models: &dyn ModelLookup, token: &Token, collection: &AppCollection) -> Result<Filter> {
    let Some(role) = token.role.as_deref() else {
        return Ok(Filter::All);
    };
    let model = collection.model();
    let Some(auth_filter) = model.role_filter(role)? else {
        return Ok(Filter::All);
    };
    let short = model.app_short_id.as_deref().unwrap_or_default();
    resolve(models, token, short, &auth_filter, model).await
}
