//! Sessman Store - TTL session storage over interchangeable backends
//!
//! This crate provides server-side session state keyed by
//! `(session_id, client_ip)`:
//!
//! - A relational backend on an embedded SQLite file, with a background reaper
//! - A document backend on MongoDB, with a server-side TTL index
//! - A session manager facade that opens the configured backend lazily
//! - A request-shaped entry point for the `new` / `get` / `update` operations
//!
//! ## Architecture
//!
//! Both backends implement [`SessionBackend`] and follow the same liveness
//! rule: a session is live while `now - last_touched_at < ttl`, and every
//! successful read or write touches it.

pub mod clock;
pub mod codec;
#[cfg(feature = "mongodb")]
pub mod document;
pub mod errors;
pub mod health;
pub mod manager;
pub mod reaper;
pub mod request;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod storage;
pub mod types;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
#[cfg(feature = "mongodb")]
pub use document::{DocumentConfig, MongoBackend};
pub use errors::{ErrorKind, SessionError, SessionResult};
pub use health::FailureTracker;
pub use manager::SessionManager;
pub use reaper::{ReaperConfig, ReaperHandle, ReaperStatus, Sweeper};
pub use request::{ResponseStatus, SessionOp, SessionRequest, SessionResponse};
#[cfg(feature = "sqlite")]
pub use sqlite::{RelationalConfig, SqliteBackend};
pub use storage::{BackendKind, SessionBackend};
pub use types::{
    expiry_cutoff, new_session_id, SessionCookie, SessionData, SessionRecord, SessionToken,
};

// Re-export so downstream backends can implement the trait
pub use async_trait::async_trait;
