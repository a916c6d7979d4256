//! Tracing subscriber setup for the binaries.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::Config;
use crate::error::{DbError, Result};

/// Log file prefix inside the configured log directory.
const LOG_FILE: &str = "tenantdb.log";

/// `RUST_LOG` wins over the configured filter when set.
pub fn env_filter(config: &Config) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .map_err(|e| DbError::Config(format!("invalid log filter {}: {}", config.log_filter, e))),
    }
}

/// Install the global subscriber. The returned guard flushes the file writer
/// and must live as long as the process.
pub fn init(config: &Config) -> Result<Option<WorkerGuard>> {
    let console = if config.log_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(config)?)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| DbError::Config(format!("logging already initialised: {}", e)))?;
    Ok(guard)
}
