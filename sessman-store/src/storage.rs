//! Storage backend contract
//!
//! Both backends must be indistinguishable to callers: same identifiers,
//! same liveness rule, same error kinds.

use crate::errors::{SessionError, SessionResult};
use crate::types::SessionData;
use async_trait::async_trait;
pub use sessman_core::BackendKind;
use sessman_core::MAX_TTL_SECS;

/// Session storage trait implemented by the relational and document backends
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Which engine this is
    fn kind(&self) -> BackendKind;

    /// Write a new record touched `now` and return its fresh id
    async fn create(&self, data: SessionData, client_ip: &str) -> SessionResult<String>;

    /// Read a live record and refresh its touch time in the same atomic step
    async fn get(&self, session_id: &str, client_ip: &str) -> SessionResult<SessionData>;

    /// Replace the payload of a live record and refresh its touch time
    async fn update(
        &self,
        session_id: &str,
        client_ip: &str,
        data: SessionData,
    ) -> SessionResult<SessionData>;

    /// Check that the store answers
    async fn health_check(&self) -> SessionResult<()>;

    /// True once the instance has crossed its failure threshold
    fn is_fatal(&self) -> bool;

    /// Stop background work owned by this backend
    async fn shutdown(&self);
}

pub(crate) fn require_client_ip(client_ip: &str) -> SessionResult<()> {
    if client_ip.trim().is_empty() {
        return Err(SessionError::missing("client_ip"));
    }
    Ok(())
}

pub(crate) fn require_session_id(session_id: &str) -> SessionResult<()> {
    if session_id.trim().is_empty() {
        return Err(SessionError::missing("session_id"));
    }
    Ok(())
}

pub(crate) fn require_data(data: &SessionData) -> SessionResult<()> {
    if data.is_empty() {
        return Err(SessionError::missing("data"));
    }
    Ok(())
}

pub(crate) fn require_ttl(ttl_secs: u64) -> SessionResult<()> {
    if ttl_secs == 0 {
        return Err(SessionError::invalid_argument(
            "ttl_secs",
            "must be greater than zero",
        ));
    }
    if ttl_secs > MAX_TTL_SECS {
        return Err(SessionError::invalid_argument(
            "ttl_secs",
            format!("must be at most {} seconds", MAX_TTL_SECS),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_bounds() {
        assert!(require_ttl(1).is_ok());
        assert!(require_ttl(MAX_TTL_SECS).is_ok());
        assert!(matches!(
            require_ttl(0),
            Err(SessionError::InvalidArgument { ref field, .. }) if field == "ttl_secs"
        ));
        assert!(require_ttl(MAX_TTL_SECS + 1).is_err());
        assert!(require_ttl(u64::MAX).is_err());
    }
}
