//! tenantdb server.
//!
//! Usage:
//!   cargo run --bin load_data    # optional demo data
//!   cargo run --bin tenantdb     # start the REST API (TENANTDB_REST_ADDR)
//!
//! On an empty store a SUPER app is created and its token logged once; keep
//! it, it is the only credential that can register further apps.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use tenantdb::config::Config;
use tenantdb::entities::NewApp;
use tenantdb::federation::HttpConnector;
use tenantdb::logging;
use tenantdb::models::{AuthLevel, Permission};
use tenantdb::realtime::{LogNotifier, Notifier};
use tenantdb::registry::ModelRegistry;
use tenantdb::rest::{create_router, AppState};
use tenantdb::storage::Storage;

/// Create the SUPER app when no app exists yet.
async fn bootstrap(registry: &ModelRegistry, config: &Config) -> tenantdb::error::Result<()> {
    let apps = &registry.entities().apps;
    if !apps.find_all().await?.is_empty() {
        return Ok(());
    }
    let created = apps
        .add(NewApp {
            name: config.super_app.clone(),
            kind: None,
            auth_level: AuthLevel::Super,
            permissions: vec![Permission::wildcard()],
            api_path: Some(config.super_app.clone()),
        })
        .await?;
    warn!(
        app = %created.app.id,
        token = %created.token.value,
        "Created SUPER app on empty store; this token is not shown again"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let _guard = logging::init(&config)?;

    info!(data_dir = %config.data_dir.display(), "tenantdb starting");
    let storage = Storage::open(&config.data_dir)?;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let registry = Arc::new(ModelRegistry::new(
        storage.clone(),
        Arc::new(HttpConnector::new()),
        config.federation_settings(),
        notifier.clone(),
    )?);
    bootstrap(&registry, &config).await?;
    registry.init_schema().await?;

    let app = create_router(AppState::new(registry, notifier));
    let listener = TcpListener::bind(config.rest_addr).await?;
    info!(addr = %config.rest_addr, "REST API listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage.flush().await?;
    Ok(())
}
