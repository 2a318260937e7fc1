//! Layered configuration: CLI > environment > config files > defaults.
//!
//! Every layer is a `serde_json::Value`; later layers deep-merge over earlier
//! ones and the result is deserialized into [`AppConfig`] once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use btpi_core::QueryDefinition;
use btpi_net::ProxyBases;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
/// Every 30 minutes between 8 AM and 5 PM, Monday through Friday.
pub const DEFAULT_INTERVAL: &str = "*/30 8-17 * * 1-5";
pub const ENV_PREFIXES: [&str; 3] = ["BTPI", "DATABASE", "WMS_PROXY"];
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid override `{0}`; expected key:path=value")]
    BadOverride(String),
    #[error("invalid configuration: {0}")]
    Invalid(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub btpi: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub wms_proxy: ProxyBases,
    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
    #[serde(deserialize_with = "lenient_string")]
    pub interval: String,
    pub probe_sleep_ms: u64,
    pub probe_retries: usize,
    pub json_spaces: usize,
    pub public_root: PathBuf,
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl ServerSettings {
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.public_root.join("data").join("queryList.json"))
    }

    pub fn probe_sleep(&self) -> Duration {
        Duration::from_millis(self.probe_sleep_ms)
    }
}

#[derive(Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Full connection URL; takes precedence over the discrete fields.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub user: String,
    #[serde(deserialize_with = "lenient_string")]
    pub password: String,
    #[serde(deserialize_with = "lenient_string")]
    pub server: String,
    pub port: u16,
    #[serde(deserialize_with = "lenient_string")]
    pub database: String,
    pub connection_timeout_ms: u64,
}

impl DatabaseSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Accepts strings, numbers and bools, so `DATABASE__PASSWORD=1234` still
/// lands in a `String` field after env value parsing.
fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string, got {other}"
        ))),
    }
}

/// Built-in defaults. They let a bare container start even though the
/// database values will not work in production.
pub fn defaults() -> Value {
    json!({
        "btpi": {
            "port": DEFAULT_PORT,
            "interval": DEFAULT_INTERVAL,
            "probe_sleep_ms": 3000,
            "probe_retries": 4,
            "json_spaces": 2,
            "public_root": "public",
            "log_dir": "logs"
        },
        "database": {
            "user": "dbuser",
            "password": "dbpass",
            "server": "dbserver",
            "port": 5432,
            "database": "db",
            "connection_timeout_ms": 5000
        },
        "wms_proxy": {},
        "queries": []
    })
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub config_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// `key:path=value` pairs, highest precedence.
    pub overrides: Vec<String>,
}

impl ConfigSources {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            env: Vec::new(),
            overrides: Vec::new(),
        }
    }

    pub fn with_process_env(mut self) -> Self {
        self.env = std::env::vars().collect();
        self
    }

    pub fn with_overrides(mut self, overrides: Vec<String>) -> Self {
        self.overrides = overrides;
        self
    }
}

pub fn load(sources: &ConfigSources) -> Result<AppConfig, ConfigError> {
    let mut merged = defaults();
    for name in ["config.json", "queries.json"] {
        if let Some(layer) = read_file_layer(&sources.config_dir.join(name))? {
            merge(&mut merged, layer);
        }
    }
    merge(&mut merged, env_layer(&sources.env));
    merge(&mut merged, override_layer(&sources.overrides)?);
    serde_json::from_value(merged).map_err(ConfigError::Invalid)
}

fn read_file_layer(path: &Path) -> Result<Option<Value>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let value: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    // A bare array in queries.json is shorthand for {"queries": [...]}.
    Ok(Some(match value {
        Value::Array(items) => json!({ "queries": items }),
        other => other,
    }))
}

/// Env vars like `BTPI__PORT=8080` become `{"btpi": {"port": 8080}}`.
pub fn env_layer(env: &[(String, String)]) -> Value {
    let mut layer = Value::Object(Map::new());
    for (name, raw) in env {
        let upper = name.to_ascii_uppercase();
        if upper == "DATABASE_URL" {
            set_path(&mut layer, &["database", "url"], Value::String(raw.clone()));
            continue;
        }
        if !ENV_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            continue;
        }
        let segments = name
            .split(ENV_SEPARATOR)
            .map(|s| s.to_ascii_lowercase())
            .collect::<Vec<_>>();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            continue;
        }
        let segments = segments.iter().map(String::as_str).collect::<Vec<_>>();
        set_path(&mut layer, &segments, parse_scalar(raw));
    }
    layer
}

fn override_layer(overrides: &[String]) -> Result<Value, ConfigError> {
    let mut layer = Value::Object(Map::new());
    for item in overrides {
        let (key, raw) = item
            .split_once('=')
            .ok_or_else(|| ConfigError::BadOverride(item.clone()))?;
        let segments = key.split(':').map(str::trim).collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::BadOverride(item.clone()));
        }
        set_path(&mut layer, &segments, parse_scalar(raw));
    }
    Ok(layer)
}

fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn set_path(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = root;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(obj) = cursor else {
            return;
        };
        cursor = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(obj) = cursor {
        obj.insert(last.to_string(), value);
    }
}

/// Objects merge key by key; everything else (arrays included) is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
