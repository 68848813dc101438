//! Session record and session token types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Opaque per-client payload
pub type SessionData = serde_json::Map<String, serde_json::Value>;

/// Generate a fresh 128-bit session identifier
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub client_ip: String,
    /// Epoch seconds
    pub created_at: i64,
    /// Epoch seconds, refreshed on every successful read or write
    pub last_touched_at: i64,
    pub data: SessionData,
}

impl SessionRecord {
    pub fn new(client_ip: String, data: SessionData, now: i64) -> Self {
        Self {
            session_id: new_session_id(),
            client_ip,
            created_at: now,
            last_touched_at: now,
            data,
        }
    }

    /// Live iff `now - last_touched_at < ttl`
    pub fn is_live(&self, now: i64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.last_touched_at) < ttl_as_i64(ttl_secs)
    }

    /// First instant at which the record is no longer live
    pub fn expires_at(&self, ttl_secs: u64) -> i64 {
        self.last_touched_at.saturating_add(ttl_as_i64(ttl_secs))
    }

    pub fn touch(&mut self, now: i64) {
        self.last_touched_at = now;
    }
}

fn ttl_as_i64(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs).unwrap_or(i64::MAX)
}

/// Oldest `last_touched_at` that is still live at `now`, exclusive
pub fn expiry_cutoff(now: i64, ttl_secs: u64) -> i64 {
    now.saturating_sub(ttl_as_i64(ttl_secs))
}

/// Session id minted by `new`, with the moment its cookie should expire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToken {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    pub fn new(session_id: String, now: i64, ttl_secs: u64) -> Self {
        let expires = now.saturating_add(ttl_as_i64(ttl_secs));
        Self {
            session_id,
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn cookie(&self, name: &str) -> SessionCookie {
        SessionCookie {
            name: name.to_string(),
            value: self.session_id.clone(),
            expires: self.expires_at,
            http_only: true,
        }
    }
}

/// Cookie that carries the session id to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub expires: DateTime<Utc>,
    pub http_only: bool,
}

impl SessionCookie {
    /// Render as a `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        let mut header = format!(
            "{}={}; Expires={}; Path=/",
            self.name,
            self.value,
            self.expires.format("%a, %d %b %Y %H:%M:%S GMT")
        );
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }
}
