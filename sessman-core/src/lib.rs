//! Sessman Core - ambient building blocks shared by the session store and CLI
//!
//! Error context, configuration loading, logging setup and retry policy.

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod types;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use retry::*;
pub use types::*;

// Re-export commonly used external types
pub use tracing;
