//! Session error taxonomy
//!
//! Every backend operation resolves to a value or exactly one of four typed
//! outcomes. Nothing is reported through panics or sentinel values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session operation result type
pub type SessionResult<T> = Result<T, SessionError>;

/// The four failure kinds, without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    StorageUnavailable,
    ReaperFailure,
}

/// Structured error types for session operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "error_type", content = "details")]
pub enum SessionError {
    /// No live record matches the composite key
    #[error("Session ID {session_id} not found")]
    NotFound { session_id: String },

    /// A required input is missing or malformed
    #[error("Invalid argument {field}: {message}")]
    InvalidArgument { field: String, message: String },

    /// The store could not be reached or refused the operation
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String, fatal: bool },

    /// A reaper sweep could not complete
    #[error("Reaper failure after {consecutive_failures} consecutive errors: {message}")]
    ReaperFailure {
        message: String,
        consecutive_failures: u32,
    },
}

impl SessionError {
    pub fn not_found<S: Into<String>>(session_id: S) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    pub fn invalid_argument<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// A required argument was absent or empty
    pub fn missing(field: &str) -> Self {
        Self::invalid_argument(field, format!("required argument, {}, not set", field))
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            Self::ReaperFailure { .. } => ErrorKind::ReaperFailure,
        }
    }

    /// Whether retrying the same call later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::StorageUnavailable { fatal, .. } => !fatal,
            Self::ReaperFailure { .. } => true,
            Self::NotFound { .. } | Self::InvalidArgument { .. } => false,
        }
    }

    /// True when the owning backend has crossed its failure threshold
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageUnavailable { fatal: true, .. })
    }

    /// Declined operations are normal negative results, not faults
    pub fn is_declined(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::InvalidArgument { .. })
    }

    /// Message safe to hand to an end client
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { session_id } => format!("Session ID {} not found.", session_id),
            Self::InvalidArgument { message, .. } => message.clone(),
            Self::StorageUnavailable { .. } | Self::ReaperFailure { .. } => {
                "Session storage is temporarily unavailable".to_string()
            }
        }
    }

    /// Get error category for logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::StorageUnavailable { .. } => "storage",
            Self::ReaperFailure { .. } => "reaper",
        }
    }

    /// Convert to HTTP status code
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::InvalidArgument { .. } => 400,
            Self::StorageUnavailable { .. } | Self::ReaperFailure { .. } => 503,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        Self::unavailable(format!("sqlite: {}", err))
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for SessionError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::unavailable(format!("mongodb: {}", err))
    }
}
