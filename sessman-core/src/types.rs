//! Configuration data types

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level configuration for a sessman process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessmanConfig {
    pub session: SessionSettings,
    pub sqlite: SqliteSettings,
    pub mongodb: MongoSettings,
    pub retry: RetrySettings,
    pub logging: LoggingConfig,
}

/// Storage engine behind the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Embedded, file-based store with a background reaper
    #[serde(rename = "sqlite", alias = "relational")]
    Relational,
    /// Networked document store with native TTL expiry
    #[serde(rename = "mongodb", alias = "document")]
    Document,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Relational => "sqlite",
            BackendKind::Document => "mongodb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manager-wide session policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Which backend serves session traffic
    pub backend: BackendKind,
    /// Seconds of inactivity after which a session expires
    pub ttl_secs: u64,
    /// Cookie carrying the session id back to the client
    pub cookie_name: String,
}

/// Relational backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    /// Database file
    pub database: Option<String>,
    /// Session table name
    pub table: String,
    /// Seconds between reaper sweeps
    pub sweep_interval_secs: u64,
    /// Consecutive failures tolerated before the store is declared fatal
    pub max_consecutive_failures: u32,
}

/// Document backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoSettings {
    /// host:port of the server
    pub server_url: String,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Session collection name
    pub collection: String,
    /// Consecutive failures tolerated before the backend is declared fatal
    pub max_consecutive_failures: u32,
}

/// Backoff policy for (re)connecting to a store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}
