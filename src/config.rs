//! Process configuration from the environment (and an optional `.env`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::federation::FederationSettings;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub rest_addr: SocketAddr,
    pub handshake_delay: Duration,
    pub handshake_timeout: Duration,
    pub handshake_retry: Duration,
    pub allow_unauthorized: bool,
    /// Name of the SUPER app created on an empty store.
    pub super_app: String,
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tenantdb_data"),
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 11111)),
            handshake_delay: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(30_000),
            handshake_retry: Duration::from_millis(1_000),
            allow_unauthorized: false,
            super_app: "super".into(),
            log_filter: "info".into(),
            log_dir: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Load `.env` if present, then read `TENANTDB_*` variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            data_dir: get("TENANTDB_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            rest_addr: parse_or("TENANTDB_REST_ADDR", get("TENANTDB_REST_ADDR"), defaults.rest_addr)?,
            handshake_delay: millis_or("TENANTDB_HANDSHAKE_DELAY_MS", get("TENANTDB_HANDSHAKE_DELAY_MS"), defaults.handshake_delay)?,
            handshake_timeout: millis_or(
                "TENANTDB_HANDSHAKE_TIMEOUT_MS",
                get("TENANTDB_HANDSHAKE_TIMEOUT_MS"),
                defaults.handshake_timeout,
            )?,
            handshake_retry: millis_or("TENANTDB_HANDSHAKE_RETRY_MS", get("TENANTDB_HANDSHAKE_RETRY_MS"), defaults.handshake_retry)?,
            allow_unauthorized: flag_or(
                "TENANTDB_ALLOW_UNAUTHORIZED",
                get("TENANTDB_ALLOW_UNAUTHORIZED"),
                defaults.allow_unauthorized,
            )?,
            super_app: get("TENANTDB_SUPER_APP").unwrap_or(defaults.super_app),
            log_filter: get("TENANTDB_LOG").unwrap_or(defaults.log_filter),
            log_dir: get("TENANTDB_LOG_DIR").map(PathBuf::from),
            log_json: flag_or("TENANTDB_LOG_JSON", get("TENANTDB_LOG_JSON"), defaults.log_json)?,
        })
    }

    pub fn federation_settings(&self) -> FederationSettings {
        FederationSettings {
            handshake_delay: self.handshake_delay,
            handshake_timeout: self.handshake_timeout,
            retry_interval: self.handshake_retry,
            allow_unauthorized: self.allow_unauthorized,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DbError::Config(format!("{} has an invalid value: {}", key, raw))),
    }
}

fn millis_or(key: &str, raw: Option<String>, default: Duration) -> Result<Duration> {
    let ms: Option<u64> = raw.map(|r| parse_or(key, Some(r), 0)).transpose()?;
    Ok(ms.map(Duration::from_millis).unwrap_or(default))
}

fn flag_or(key: &str, raw: Option<String>, default: bool) -> Result<bool> {
    match raw.as_deref().map(|r| r.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(DbError::Config(format!("{} has an invalid value: {}", key, v))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.rest_addr.port(), 11111);
        let settings = config.federation_settings();
        assert_eq!(settings.handshake_delay, Duration::from_millis(500));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TENANTDB_DATA_DIR", "/tmp/t"),
            ("TENANTDB_REST_ADDR", "127.0.0.1:8080"),
            ("TENANTDB_HANDSHAKE_TIMEOUT_MS", "250"),
            ("TENANTDB_ALLOW_UNAUTHORIZED", "yes"),
            ("TENANTDB_LOG_DIR", "logs"),
            ("TENANTDB_LOG_JSON", "true"),
        ])
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/t"));
        assert_eq!(config.rest_addr.port(), 8080);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert!(config.allow_unauthorized);
        assert!(config.federation_settings().allow_unauthorized);
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        assert!(config.log_json);
    }

    #[test]
    fn test_malformed_values() {
        assert!(matches!(load(&[("TENANTDB_REST_ADDR", "nowhere")]), Err(DbError::Config(_))));
        assert!(matches!(load(&[("TENANTDB_HANDSHAKE_DELAY_MS", "-1")]), Err(DbError::Config(_))));
        assert!(matches!(load(&[("TENANTDB_LOG_JSON", "maybe")]), Err(DbError::Config(_))));
    }
}
