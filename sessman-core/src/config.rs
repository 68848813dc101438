//! Configuration loading and validation

use crate::error::{CoreError, CoreResult, ErrorContext};
use crate::retry::RetryConfig;
use crate::types::{
    BackendKind, MongoSettings, RetrySettings, SessionSettings, SessmanConfig, SqliteSettings,
};
use config::{Config, Environment, File, FileFormat};
use std::path::Path;

/// Prefix for environment overrides, e.g. `SESSMAN__SESSION__TTL_SECS=600`
pub const ENV_PREFIX: &str = "SESSMAN";

/// Longest accepted session TTL, one hundred years
pub const MAX_TTL_SECS: u64 = 100 * 365 * 86_400;

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Relational,
            ttl_secs: 86400,
            cookie_name: "PS_SESSID".to_string(),
        }
    }
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            database: None,
            table: "sessions".to_string(),
            sweep_interval_secs: 60,
            max_consecutive_failures: 50,
        }
    }
}

impl Default for MongoSettings {
    fn default() -> Self {
        Self {
            server_url: "localhost:27017".to_string(),
            database: None,
            username: None,
            password: None,
            collection: "sessions".to_string(),
            max_consecutive_failures: 50,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            backoff_multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
        }
    }
}

/// True when `name` can be interpolated into SQL as a bare identifier
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SessmanConfig {
    /// Load configuration from an optional TOML file, then environment overrides
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().map_err(|e| CoreError::Config {
            message: format!("Failed to read configuration: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("build")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        settings
            .try_deserialize::<SessmanConfig>()
            .map_err(|e| CoreError::Config {
                message: format!("Failed to parse configuration: {}", e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("config")
                    .with_operation("deserialize")
                    .with_suggestion("Check TOML syntax and value types"),
            })
    }

    /// Load configuration from a TOML file only, without environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        toml::from_str(&content).map_err(|e| CoreError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> CoreResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        std::fs::write(path, content).map_err(|e| CoreError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Validate configuration for the selected backend
    pub fn validate(&self) -> CoreResult<()> {
        if self.session.ttl_secs == 0 {
            return Err(crate::validation_error!(
                "Session TTL must be greater than 0",
                "session.ttl_secs",
                "config"
            ));
        }

        if self.session.ttl_secs > MAX_TTL_SECS {
            return Err(crate::validation_error!(
                format!("Session TTL must be at most {} seconds", MAX_TTL_SECS),
                "session.ttl_secs",
                "config"
            ));
        }

        if self.session.cookie_name.trim().is_empty() {
            return Err(crate::validation_error!(
                "Cookie name must not be empty",
                "session.cookie_name",
                "config"
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(crate::validation_error!(
                "Retry max_attempts must be at least 1",
                "retry.max_attempts",
                "config"
            ));
        }

        match self.session.backend {
            BackendKind::Relational => self.validate_sqlite(),
            BackendKind::Document => self.validate_mongodb(),
        }
    }

    fn validate_sqlite(&self) -> CoreResult<()> {
        let missing = self
            .sqlite
            .database
            .as_deref()
            .map_or(true, |db| db.trim().is_empty());
        if missing {
            return Err(CoreError::Config {
                message: "No sqlite database specified".to_string(),
                source: None,
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set sqlite.database to a file path"),
            });
        }

        if !is_valid_identifier(&self.sqlite.table) {
            return Err(crate::validation_error!(
                format!("Invalid table name: {:?}", self.sqlite.table),
                "sqlite.table",
                "config"
            ));
        }

        if self.sqlite.sweep_interval_secs == 0 {
            return Err(crate::validation_error!(
                "Sweep interval must be greater than 0",
                "sqlite.sweep_interval_secs",
                "config"
            ));
        }

        Ok(())
    }

    fn validate_mongodb(&self) -> CoreResult<()> {
        for (field, value) in [
            ("mongodb.database", &self.mongodb.database),
            ("mongodb.username", &self.mongodb.username),
            ("mongodb.password", &self.mongodb.password),
        ] {
            if value.as_deref().map_or(true, str::is_empty) {
                return Err(CoreError::Config {
                    message: format!("Missing value for {}", field),
                    source: None,
                    context: ErrorContext::new("config")
                        .with_operation("validate")
                        .with_detail("field", field),
                });
            }
        }

        if self.mongodb.collection.trim().is_empty() {
            return Err(crate::validation_error!(
                "Collection name must not be empty",
                "mongodb.collection",
                "config"
            ));
        }

        Ok(())
    }
}
