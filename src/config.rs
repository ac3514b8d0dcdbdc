//! Environment-driven configuration for migration runs.
//!
//! Every setting has a default so a bare `legacy-migrator plan` works
//! without any environment. Command-line flags override these values.

use crate::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

fn env_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

/// Where the mapping cache lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    /// In memory, persisted to a bincode file at checkpoints.
    #[default]
    File,
    /// The `migration_mappings` table of the target database.
    Postgres,
}

impl FromStr for CacheBackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "file" => Ok(CacheBackendKind::File),
            "postgres" | "pg" => Ok(CacheBackendKind::Postgres),
            other => Err(ConfigError::InvalidValue {
                key: "MIGRATION_CACHE_BACKEND".to_string(),
                message: format!("expected 'file' or 'postgres', got '{}'", other),
            }),
        }
    }
}

/// Settings shared by all subcommands.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Default source connection string (`MIGRATION_SOURCE_URL`).
    pub source_url: Option<String>,
    /// Target store connection string (`DATABASE_URL`).
    pub target_url: Option<String>,
    /// Source-system id used to namespace mapping keys.
    pub source_name: String,
    pub batch_size: u64,
    /// Pages between mapping cache saves.
    pub checkpoint_pages: u64,
    pub cache_backend: CacheBackendKind,
    pub cache_path: PathBuf,
    pub progress_every: u64,
    /// Create a placeholder item for invoices without purchase rows.
    pub order_placeholder_items: bool,
    pub max_connections: u32,
    connections: Vec<(String, String)>,
}

impl MigrationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let connections = env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("MIGRATION_CONNECTION_")
                    .and_then(|rest| rest.strip_suffix("_URL"))
                    .map(|name| (name.to_ascii_lowercase(), value))
            })
            .collect();

        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        config.connections = connections;
        Ok(config)
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let cache_backend = match lookup("MIGRATION_CACHE_BACKEND") {
            Some(value) => value.parse()?,
            None => CacheBackendKind::default(),
        };

        Ok(Self {
            source_url: lookup("MIGRATION_SOURCE_URL"),
            target_url: lookup("DATABASE_URL"),
            source_name: env_string(&lookup, "MIGRATION_SOURCE_NAME", "invision"),
            batch_size: env_u64(&lookup, "MIGRATION_BATCH_SIZE", 100).max(1),
            checkpoint_pages: env_u64(&lookup, "MIGRATION_CHECKPOINT_PAGES", 10).max(1),
            cache_backend,
            cache_path: PathBuf::from(env_string(
                &lookup,
                "MIGRATION_CACHE_PATH",
                "./cache/mappings.bin",
            )),
            progress_every: env_u64(&lookup, "MIGRATION_PROGRESS_EVERY", 250).max(1),
            order_placeholder_items: env_bool(&lookup, "MIGRATION_ORDER_PLACEHOLDER_ITEMS", true),
            max_connections: env_u32(&lookup, "MIGRATION_MAX_CONNECTIONS", 5).max(1),
            connections: Vec::new(),
        })
    }

    pub fn with_connection(mut self, name: &str, url: impl Into<String>) -> Self {
        self.connections.push((name.to_ascii_lowercase(), url.into()));
        self
    }

    /// Source connection string for a named connection, falling back to
    /// `MIGRATION_SOURCE_URL` when no name is given.
    pub fn source_url_for(&self, connection: Option<&str>) -> Result<String, ConfigError> {
        match connection {
            Some(name) => self
                .connections
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(name))
                .map(|(_, url)| url.clone())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "--connection".to_string(),
                    message: format!(
                        "no MIGRATION_CONNECTION_{}_URL configured",
                        name.to_ascii_uppercase()
                    ),
                }),
            None => self.source_url.clone().ok_or_else(|| ConfigError::InvalidValue {
                key: "MIGRATION_SOURCE_URL".to_string(),
                message: "not set".to_string(),
            }),
        }
    }

    pub fn target_url(&self) -> Result<String, ConfigError> {
        self.target_url.clone().ok_or_else(|| ConfigError::InvalidValue {
            key: "DATABASE_URL".to_string(),
            message: "not set".to_string(),
        })
    }
}
