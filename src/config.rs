//! Store configuration, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Which backend persists the namespace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "embedded-kv")]
    EmbeddedKv,
    #[serde(rename = "relational")]
    Relational,
}

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Capacity reported by `filesystem_statistics`; the store itself does
    /// not enforce quotas.
    pub capacity_bytes: u64,
    pub capacity_files: u64,
    pub kv: KvConfig,
    pub sql: SqlConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::EmbeddedKv,
            capacity_bytes: 1 << 40,
            capacity_files: 1 << 24,
            kv: KvConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(raw: &str) -> StoreResult<StoreConfig> {
        toml::from_str(raw)
            .map_err(|err| StoreError::invalid_argument(format!("bad store config: {err}")))
    }

    pub fn load(path: &Path) -> StoreResult<StoreConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| StoreError::io(format!("read {}: {err}", path.display())))?;
        Self::from_toml_str(&raw)
    }
}

/// Embedded key-value backend options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Directory holding the database file.
    pub directory: PathBuf,
    /// Page-cache budget handed to the engine; `None` keeps the engine
    /// default.
    pub cache_bytes: Option<usize>,
    /// Reclaim free pages before serving traffic.
    pub compact_on_open: bool,
    pub statistics_cache_ttl_secs: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./dittofs-meta"),
            cache_bytes: None,
            compact_on_open: false,
            statistics_cache_ttl_secs: 5,
        }
    }
}

impl KvConfig {
    pub fn statistics_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.statistics_cache_ttl_secs)
    }
}

/// TLS posture for the relational backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SslModeOption {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

/// Migration policy at startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    /// Apply pending migrations under an advisory lock.
    #[default]
    Auto,
    /// Only verify the schema version; an operator applies migrations.
    Manual,
}

/// Relational backend options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslModeOption,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_connection_lifetime_secs: Option<u64>,
    pub max_connection_idle_secs: Option<u64>,
    pub health_check_period_secs: u64,
    pub connect_timeout_secs: u64,
    pub statement_timeout_ms: Option<u64>,
    pub statistics_cache_ttl_secs: u64,
    pub migration_mode: MigrationMode,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            database: "dittofs".into(),
            user: "dittofs".into(),
            password: String::new(),
            ssl_mode: SslModeOption::default(),
            max_connections: 16,
            min_connections: 1,
            max_connection_lifetime_secs: Some(30 * 60),
            max_connection_idle_secs: Some(10 * 60),
            health_check_period_secs: 30,
            connect_timeout_secs: 10,
            statement_timeout_ms: None,
            statistics_cache_ttl_secs: 5,
            migration_mode: MigrationMode::default(),
        }
    }
}

impl SqlConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period_secs)
    }

    pub fn max_connection_lifetime(&self) -> Option<Duration> {
        self.max_connection_lifetime_secs.map(Duration::from_secs)
    }

    pub fn max_connection_idle(&self) -> Option<Duration> {
        self.max_connection_idle_secs.map(Duration::from_secs)
    }

    pub fn statistics_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.statistics_cache_ttl_secs)
    }
}
