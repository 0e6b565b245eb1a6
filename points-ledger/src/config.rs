//! Configuration for the points ledger

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::AccountId;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Which store backs the ledger
    pub storage: StorageBackend,

    /// Postgres settings
    pub database: DatabaseConfig,

    /// Ledger rules
    pub ledger: LedgerConfig,

    /// Audit retention
    pub audit: AuditConfig,

    /// Export formatting
    pub export: ExportConfig,

    /// Listing defaults
    pub paging: PagingConfig,

    /// HTTP surface
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "points-ledger".to_string(),
            storage: StorageBackend::default(),
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            audit: AuditConfig::default(),
            export: ExportConfig::default(),
            paging: PagingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Postgres via sqlx
    #[default]
    Postgres,
    /// Process-local tables; nothing survives a restart
    Memory,
}

/// Postgres configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,

    /// Pool size
    pub max_connections: u32,

    /// How long to wait for a pooled connection (milliseconds)
    pub acquire_timeout_ms: u64,

    /// How long a transaction waits for an account row lock (milliseconds)
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            lock_timeout_ms: 5_000,
        }
    }
}

/// Ledger rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Largest magnitude a single entry may carry; larger inputs are clamped
    pub clamp_bound: i64,

    /// Account that can never lose its admin grant
    pub root_account: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            clamp_bound: 100,
            root_account: "113062206".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Parsed root account id
    pub fn root_account_id(&self) -> crate::Result<AccountId> {
        AccountId::parse(&self.root_account)
            .map_err(|e| crate::Error::Config(format!("ledger.root_account: {}", e)))
    }
}

/// Audit retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Audit rows older than this are purged
    pub retention_days: i64,

    /// Seconds between purge sweeps
    pub sweep_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval_secs: 3_600,
        }
    }
}

/// Export formatting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// IANA zone used for timestamps in dumps and audit descriptions
    pub display_timezone: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            display_timezone: "Asia/Taipei".to_string(),
        }
    }
}

impl ExportConfig {
    /// Parsed display timezone
    pub fn timezone(&self) -> crate::Result<Tz> {
        self.display_timezone.parse::<Tz>().map_err(|e| {
            crate::Error::Config(format!("export.display_timezone: {}", e))
        })
    }
}

/// Listing defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Rows per page when the caller does not say
    pub default_page_size: u32,

    /// Upper bound on caller-supplied page sizes
    pub max_page_size: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 200,
        }
    }
}

/// HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from `POINTS_CONFIG` (if set), then apply environment overrides
    pub fn from_env() -> crate::Result<Self> {
        let mut config = match std::env::var("POINTS_CONFIG") {
            Ok(path) => Config::from_file(path)?,
            Err(_) => Config::default(),
        };

        if let Ok(url) = std::env::var("POINTS_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            config.database.url = url;
        }

        if let Ok(root) = std::env::var("POINTS_ROOT_ACCOUNT") {
            config.ledger.root_account = root;
        }

        if let Ok(addr) = std::env::var("POINTS_LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Ok(backend) = std::env::var("POINTS_STORAGE") {
            config.storage = match backend.as_str() {
                "postgres" => StorageBackend::Postgres,
                "memory" => StorageBackend::Memory,
                other => {
                    return Err(crate::Error::Config(format!(
                        "POINTS_STORAGE must be postgres or memory, got {:?}",
                        other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage == StorageBackend::Postgres && self.database.url.is_empty() {
            return Err(crate::Error::Config("database.url is required".to_string()));
        }
        if self.ledger.clamp_bound < 1 {
            return Err(crate::Error::Config(
                "ledger.clamp_bound must be at least 1".to_string(),
            ));
        }
        if self.audit.retention_days < 1 {
            return Err(crate::Error::Config(
                "audit.retention_days must be at least 1".to_string(),
            ));
        }
        if self.audit.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "audit.sweep_interval_secs cannot be 0".to_string(),
            ));
        }
        if self.paging.default_page_size == 0
            || self.paging.default_page_size > self.paging.max_page_size
        {
            return Err(crate::Error::Config(
                "paging.default_page_size must be between 1 and paging.max_page_size".to_string(),
            ));
        }
        self.ledger.root_account_id()?;
        self.export.timezone()?;
        Ok(())
    }
}
