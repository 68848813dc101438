//! Payload encoding for text-only storage columns
//!
//! `data` is serialized to JSON, then base64 encoded. Backends store the
//! resulting string verbatim and never look inside it.

use crate::errors::{SessionError, SessionResult};
use crate::types::SessionData;
use base64::{engine::general_purpose::STANDARD, Engine as _};

pub fn encode(data: &SessionData) -> SessionResult<String> {
    let json = serde_json::to_vec(data)
        .map_err(|e| SessionError::invalid_argument("data", format!("unserializable: {}", e)))?;
    Ok(STANDARD.encode(json))
}

pub fn decode(encoded: &str) -> SessionResult<SessionData> {
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| SessionError::unavailable(format!("corrupt session payload: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::unavailable(format!("corrupt session payload: {}", e)))
}
