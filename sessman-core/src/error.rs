//! Unified error handling for the ambient layers
//!
//! Configuration, logging and file I/O failures carry an [`ErrorContext`] so
//! operators can correlate a log line with the failing component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, warn};

pub type CoreResult<T> = Result<T, CoreError>;

/// Where a process-level failure happened, and what the operator can do about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Correlates the returned error with its log line
    pub error_id: String,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub operation: Option<String>,
    /// Offending setting, file or value, by name
    pub details: BTreeMap<String, String>,
    /// Shown to the operator after the message
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            details: BTreeMap::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_detail(mut self, key: &str, value: &str) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }
}

/// Configuration, logging and file I/O failures
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("Logging setup error: {message}")]
    Logging {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            CoreError::Config { context, .. }
            | CoreError::Validation { context, .. }
            | CoreError::Logging { context, .. } => Some(context),
            CoreError::Io(_) => None,
        }
    }

    /// Emit one log line carrying the error id and component
    pub fn log(&self) {
        let Some(context) = self.context() else {
            warn!(error = %self, "IO error");
            return;
        };

        match self {
            CoreError::Validation { field, .. } => warn!(
                error_id = %context.error_id,
                component = %context.component,
                field = ?field,
                error = %self,
                "Rejected configuration value"
            ),
            _ => error!(
                error_id = %context.error_id,
                component = %context.component,
                operation = ?context.operation,
                suggestions = ?context.suggestions,
                error = %self,
                "Setup failed"
            ),
        }
    }
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::CoreError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file")
                .with_suggestion("Run 'sessman config --init' to create a default config"),
        }
    };
    ($msg:expr, $component:expr, $source:expr) => {
        $crate::CoreError::Config {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file"),
        }
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr, $field:expr, $component:expr) => {
        $crate::CoreError::Validation {
            message: $msg.to_string(),
            field: Some($field.to_string()),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check the field value and format"),
        }
    };
}
