//! Seed a demo app into the store.
//!
//! Creates a `demo` app with an `orders` and a `customers` collection and a
//! handful of documents, then prints the app token. Run while the server is
//! stopped (sled holds an exclusive lock on the data directory):
//!   cargo run --bin load_data

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use tenantdb::collection::DocumentCollection;
use tenantdb::config::Config;
use tenantdb::entities::NewApp;
use tenantdb::federation::HttpConnector;
use tenantdb::logging;
use tenantdb::models::{AuthLevel, Permission};
use tenantdb::realtime::LogNotifier;
use tenantdb::registry::ModelRegistry;
use tenantdb::schema::decode_value;
use tenantdb::storage::Storage;

const API_PATH: &str = "demo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let _guard = logging::init(&config)?;
    let storage = Storage::open(&config.data_dir)?;
    let registry = ModelRegistry::new(
        storage.clone(),
        Arc::new(HttpConnector::new()),
        config.federation_settings(),
        Arc::new(LogNotifier),
    )?;
    let apps = &registry.entities().apps;

    if apps.find_by_api_path(API_PATH).await?.is_some() {
        println!("App '{}' already exists, nothing to do", API_PATH);
        return Ok(());
    }

    let created = apps
        .add(NewApp {
            name: "Demo shop".into(),
            kind: Some("server".into()),
            auth_level: AuthLevel::Admin,
            permissions: vec![Permission::wildcard()],
            api_path: Some(API_PATH.into()),
        })
        .await?;

    let schema = decode_value(&json!([
        {
            "name": "customers",
            "extends": ["timestamps"],
            "properties": {
                "number": {"__type": "number", "__required": true},
                "name": {"__type": "string", "__required": true},
                "tier": {"__type": "string", "__enum": ["basic", "gold"], "__default": "basic"}
            }
        },
        {
            "name": "orders",
            "extends": ["timestamps"],
            "properties": {
                "customerId": {"__type": "number", "__required": true},
                "status": {"__type": "string", "__enum": ["open", "shipped", "closed"], "__default": "open"},
                "tags": {"__type": "array", "__itemtype": "string"},
                "lines": {"__type": "array", "__schema": {
                    "sku": {"__type": "string", "__required": true},
                    "qty": {"__type": "number", "__default": 1}
                }}
            },
            "roles": [{
                "name": "customer",
                "authFilter": {
                    "env": {"mine": {"schema.customers.number": {"$gt": 0}, "map": "number"}},
                    "query": {"customerId": {"$in": "env.mine"}}
                }
            }]
        }
    ]))?;
    apps.update_schema(created.app.id, schema).await?;
    let app = apps
        .find_by_id(created.app.id)
        .await?
        .ok_or("demo app vanished after schema update")?;
    registry.init_app(&app).await?;

    let customers = registry.collection(&app, "customers").await?;
    customers
        .add(
            json!([
                {"number": 7, "name": "Ada", "tier": "gold"},
                {"number": 9, "name": "Brian"}
            ]),
            Default::default(),
        )
        .await?;

    let orders = registry.collection(&app, "orders").await?;
    let added = orders
        .add(
            json!([
                {"customerId": 7, "tags": ["rush"], "lines": [{"sku": "A-1", "qty": 2}]},
                {"customerId": 7, "status": "shipped", "lines": [{"sku": "B-2"}]},
                {"customerId": 9, "lines": []}
            ]),
            Default::default(),
        )
        .await?;
    info!(orders = added.len(), "Demo documents loaded");

    storage.flush().await?;
    println!("Demo app '{}' created.", API_PATH);
    println!("App token: {}", created.token.value);
    println!("Try: tenantdb-cli --token <token> search -p {} -C orders", API_PATH);
    Ok(())
}
