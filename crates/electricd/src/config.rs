//! Service configuration
//!
//! Read from the environment at startup. Parse failures and range checks
//! are collected so a misconfigured deployment reports every problem at
//! once.

use electric_core::{CacheConfig, ReaderConfig, StorageConfig};
use electric_pg::pipeline::{DEFAULT_PUBLICATION, DEFAULT_SLOT_NAME};
use electric_pg::{ConnectionConfig, PipelineConfig, DEFAULT_POOL_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_LONG_POLL_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_STORAGE_DIR: &str = "./electric_data";

/// Every problem found in the configuration
#[derive(Debug, Error)]
#[error("invalid configuration: {}", .0.join("; "))]
pub struct ConfigError(pub Vec<String>);

/// Storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    #[default]
    File,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "file" => Ok(StorageKind::File),
            other => Err(format!("ELECTRIC_STORAGE must be 'memory' or 'file', got '{other}'")),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// PostgreSQL DSN; never serialized
    #[serde(skip_serializing, default)]
    pub database_url: Option<String>,
    pub port: u16,
    pub long_poll_timeout_ms: u64,
    pub chunk_threshold: u64,
    pub max_age: u64,
    pub stale_age: u64,
    pub storage: StorageKind,
    pub storage_dir: PathBuf,
    pub replication_slot: String,
    pub publication: String,
    /// Shared secret for `/v1/shape`; never serialized
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    pub db_pool_size: usize,
    /// 0 = unlimited
    pub max_shapes: usize,
    pub consumer_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: DEFAULT_PORT,
            long_poll_timeout_ms: DEFAULT_LONG_POLL_TIMEOUT_MS,
            chunk_threshold: electric_core::DEFAULT_CHUNK_THRESHOLD,
            max_age: 604_800,
            stale_age: 300,
            storage: StorageKind::File,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            replication_slot: DEFAULT_SLOT_NAME.to_string(),
            publication: DEFAULT_PUBLICATION.to_string(),
            secret: None,
            db_pool_size: DEFAULT_POOL_SIZE,
            max_shapes: 0,
            consumer_buffer: electric_core::DEFAULT_CONSUMER_BUFFER,
        }
    }
}

impl Config {
    /// Load from the process environment and validate
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source and validate
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();
        let mut config = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.database_url = get("DATABASE_URL");
        config.secret = get("ELECTRIC_SECRET");

        if let Some(v) = get("ELECTRIC_PORT") {
            match v.trim().parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => errors.push("ELECTRIC_PORT must be between 1 and 65535".to_string()),
            }
        }
        parse_into(&get, "ELECTRIC_LONG_POLL_TIMEOUT", &mut config.long_poll_timeout_ms, &mut errors);
        parse_into(&get, "ELECTRIC_CHUNK_THRESHOLD", &mut config.chunk_threshold, &mut errors);
        parse_into(&get, "ELECTRIC_MAX_AGE", &mut config.max_age, &mut errors);
        parse_into(&get, "ELECTRIC_STALE_AGE", &mut config.stale_age, &mut errors);
        parse_into(&get, "ELECTRIC_DB_POOL_SIZE", &mut config.db_pool_size, &mut errors);
        parse_into(&get, "ELECTRIC_MAX_SHAPES", &mut config.max_shapes, &mut errors);
        parse_into(&get, "ELECTRIC_CONSUMER_BUFFER", &mut config.consumer_buffer, &mut errors);

        if let Some(v) = get("ELECTRIC_STORAGE") {
            match v.trim().parse() {
                Ok(kind) => config.storage = kind,
                Err(e) => errors.push(e),
            }
        }
        if let Some(v) = lookup("ELECTRIC_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ELECTRIC_REPLICATION_SLOT") {
            config.replication_slot = v;
        }
        if let Some(v) = lookup("ELECTRIC_PUBLICATION") {
            config.publication = v;
        }

        errors.extend(config.problems());
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError(errors))
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError(problems))
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match &self.database_url {
            None => problems.push("DATABASE_URL is required".to_string()),
            Some(dsn) => {
                if let Err(e) = ConnectionConfig::parse(dsn) {
                    problems.push(format!("DATABASE_URL is invalid: {e}"));
                }
            }
        }
        if self.port == 0 {
            problems.push("ELECTRIC_PORT must be between 1 and 65535".to_string());
        }
        if self.long_poll_timeout_ms == 0 {
            problems.push("ELECTRIC_LONG_POLL_TIMEOUT must be positive".to_string());
        }
        if self.chunk_threshold == 0 {
            problems.push("ELECTRIC_CHUNK_THRESHOLD must be positive".to_string());
        }
        if self.storage == StorageKind::File && self.storage_dir.as_os_str().is_empty() {
            problems.push("ELECTRIC_STORAGE_DIR must not be empty".to_string());
        }
        if self.replication_slot.trim().is_empty() {
            problems.push("ELECTRIC_REPLICATION_SLOT must not be empty".to_string());
        }
        if self.publication.trim().is_empty() {
            problems.push("ELECTRIC_PUBLICATION must not be empty".to_string());
        }
        if self.db_pool_size == 0 {
            problems.push("ELECTRIC_DB_POOL_SIZE must be at least 1".to_string());
        }
        if self.consumer_buffer == 0 {
            problems.push("ELECTRIC_CONSUMER_BUFFER must be at least 1".to_string());
        }
        problems
    }

    pub fn with_database_url(mut self, dsn: impl Into<String>) -> Self {
        self.database_url = Some(dsn.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_storage(mut self, kind: StorageKind) -> Self {
        self.storage = kind;
        self
    }

    pub fn with_max_shapes(mut self, max: usize) -> Self {
        self.max_shapes = max;
        self
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    /// In-flight requests get this long to finish after a shutdown signal
    pub fn drain_timeout(&self) -> Duration {
        self.long_poll_timeout() + Duration::from_secs(10)
    }

    pub fn storage_config(&self) -> StorageConfig {
        match self.storage {
            StorageKind::Memory => StorageConfig::Memory,
            StorageKind::File => StorageConfig::File {
                dir: self.storage_dir.clone(),
            },
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_chunk_threshold(self.chunk_threshold)
            .with_max_shapes(self.max_shapes)
            .with_consumer_buffer(self.consumer_buffer)
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig::default()
            .with_long_poll_timeout(self.long_poll_timeout())
            .with_max_age(self.max_age)
            .with_stale_age(self.stale_age)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_slot_name(&self.replication_slot)
            .with_publication(&self.publication)
    }
}

/// Parse an optional numeric variable, recording a message on failure
fn parse_into<T, G>(get: &G, key: &str, target: &mut T, errors: &mut Vec<String>)
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(key) {
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => errors.push(format!("{key} must be a non-negative integer, got '{value}'")),
        }
    }
}
