//! Configuration schema (metasync.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::qualified;
use crate::scope::ScopeDescriptor;

/// Source engine behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// PostgreSQL and wire-compatible servers
    Postgres,

    /// Snowflake
    Snowflake,

    /// JSON fixture describing a source, no live server
    Fixture,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Snowflake => "snowflake",
            Self::Fixture => "fixture",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source server to crawl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique connection name, recorded on every run
    pub name: String,

    pub engine: EngineKind,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    /// Name of the environment variable holding the secret
    #[serde(default)]
    pub credential_env: Option<String>,

    /// Restricts the crawl to databases matching this pattern list
    #[serde(default)]
    pub default_database: Option<String>,

    #[serde(default)]
    pub tls: bool,

    /// Snowflake account locator
    #[serde(default)]
    pub account: Option<String>,

    /// Snowflake warehouse
    #[serde(default)]
    pub warehouse: Option<String>,

    /// Snowflake role
    #[serde(default)]
    pub role: Option<String>,

    /// Path to a JSON source fixture (fixture engine)
    #[serde(default)]
    pub fixture: Option<PathBuf>,

    #[serde(default)]
    pub scope: ScopeDescriptor,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, engine: EngineKind, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine,
            host: host.into(),
            port: None,
            user: None,
            credential_env: None,
            default_database: None,
            tls: false,
            account: None,
            warehouse: None,
            role: None,
            fixture: None,
            scope: ScopeDescriptor::default(),
        }
    }

    /// Qualified name of the server root node
    pub fn server_qualified_name(&self) -> String {
        let host = match (&self.engine, self.host.is_empty(), &self.account) {
            (EngineKind::Snowflake, true, Some(account)) => account.as_str(),
            (_, true, _) => self.name.as_str(),
            _ => self.host.as_str(),
        };
        qualified::server(host, self.port)
    }

    /// Read the secret named by `credential_env`
    pub fn resolve_credential(&self) -> Result<Option<String>, ConfigError> {
        match &self.credential_env {
            None => Ok(None),
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                ConfigError::MissingCredential(format!(
                    "connection '{}' expects credential in ${}",
                    self.name, var
                ))
            }),
        }
    }
}

/// Run policy shared by all connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Allow runs with neither a schema nor a table filter
    #[serde(default)]
    pub allow_unfiltered: bool,

    /// Schemas of one database crawled in parallel
    #[serde(default = "default_max_concurrent_schemas")]
    pub max_concurrent_schemas: usize,

    /// Collect table row-count estimates after column sync
    #[serde(default)]
    pub collect_row_counts: bool,

    /// Attempts per upsert when a concurrent writer wins the race
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
}

fn default_max_concurrent_schemas() -> usize {
    4
}

fn default_store_retry_attempts() -> u32 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_unfiltered: false,
            max_concurrent_schemas: default_max_concurrent_schemas(),
            collect_row_counts: false,
            store_retry_attempts: default_store_retry_attempts(),
        }
    }
}

/// Catalog store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process store, optionally snapshotted to a JSON file
    Memory,

    /// PostgreSQL catalog database
    Postgres,
}

impl Default for StoreKind {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Snapshot file for the memory store
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Environment variable holding the Postgres connection string
    #[serde(default)]
    pub url_env: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            store: StoreConfig::default(),
            connections: Vec::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for connection in &self.connections {
            if connection.name.trim().is_empty() {
                return Err(ConfigError::Invalid("connection name must not be empty".to_string()));
            }
            if !names.insert(connection.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connection name '{}'",
                    connection.name
                )));
            }
            if connection.engine == EngineKind::Fixture && connection.fixture.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "connection '{}' uses the fixture engine but sets no fixture path",
                    connection.name
                )));
            }
        }

        if self.policy.max_concurrent_schemas == 0 {
            return Err(ConfigError::Invalid("policy.max_concurrent_schemas must be at least 1".to_string()));
        }
        if self.store.kind == StoreKind::Postgres && self.store.url_env.is_none() {
            return Err(ConfigError::Invalid("store.url_env is required for the postgres store".to_string()));
        }

        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Resolve a path from the config against the project root
    pub fn resolve_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),
}
