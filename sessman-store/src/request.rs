//! Request-shaped entry point over the session manager
//!
//! Maps a named operation plus an argument bag onto the manager and renders
//! the outcome as a status, a JSON body and an optional cookie.

use crate::errors::{SessionError, SessionResult};
use crate::manager::SessionManager;
use crate::types::{SessionCookie, SessionData};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sessman_core::{log_operation_error, log_operation_start, log_operation_success};
use std::fmt;
use tracing::debug;

/// Arguments for one session operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    /// Operation name: `new`, `get` or `update`
    pub subpath: String,
    pub session_id: Option<String>,
    /// Session id carried by the request's cookie, used when `session_id` is absent
    pub cookie_session_id: Option<String>,
    pub client_ip: Option<String>,
    pub data: Option<SessionData>,
}

impl SessionRequest {
    pub fn new<S: Into<String>>(subpath: S) -> Self {
        Self {
            subpath: subpath.into(),
            ..Self::default()
        }
    }

    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cookie<S: Into<String>>(mut self, session_id: S) -> Self {
        self.cookie_session_id = Some(session_id.into());
        self
    }

    pub fn with_client_ip<S: Into<String>>(mut self, client_ip: S) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_data(mut self, data: SessionData) -> Self {
        self.data = Some(data);
        self
    }

    /// Explicit id if given, otherwise the cookie value
    pub fn effective_session_id(&self) -> Option<&str> {
        non_empty(self.session_id.as_deref()).or_else(|| non_empty(self.cookie_session_id.as_deref()))
    }

    fn client_ip(&self) -> SessionResult<&str> {
        non_empty(self.client_ip.as_deref()).ok_or_else(|| SessionError::missing("client_ip"))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOp {
    New,
    Get,
    Update,
}

impl SessionOp {
    pub fn parse(subpath: &str) -> SessionResult<Self> {
        match subpath.trim_matches('/') {
            "new" => Ok(SessionOp::New),
            "get" => Ok(SessionOp::Get),
            "update" => Ok(SessionOp::Update),
            other => Err(SessionError::invalid_argument(
                "subpath",
                format!("unknown session operation '{}'", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOp::New => "new",
            SessionOp::Get => "get",
            SessionOp::Update => "update",
        }
    }
}

impl fmt::Display for SessionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    /// The caller's request was rejected (bad argument, unknown session)
    Declined,
    /// The store could not serve the request
    Failed,
}

/// Outcome of [`SessionManager::handle`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionResponse {
    pub status: ResponseStatus,
    pub http_status: u16,
    pub body: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<SessionCookie>,
}

impl SessionResponse {
    fn ok(body: Value, cookie: Option<SessionCookie>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            http_status: 200,
            body,
            cookie,
        }
    }

    /// Render an error, hiding storage internals from the body
    pub fn from_error(err: &SessionError, locus: &str) -> Self {
        let status = if err.is_declined() {
            ResponseStatus::Declined
        } else {
            ResponseStatus::Failed
        };
        Self {
            status,
            http_status: err.http_status(),
            body: json!({ "error": err.user_message(), "locus": locus }),
            cookie: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

impl SessionManager {
    /// Run one named operation and render its outcome
    pub async fn handle(&self, request: SessionRequest) -> SessionResponse {
        let op = match SessionOp::parse(&request.subpath) {
            Ok(op) => op,
            Err(e) => {
                debug!("Declined session request: {}", e);
                return SessionResponse::from_error(&e, "session");
            }
        };
        let locus = format!("session.{}", op);
        log_operation_start!(locus.as_str(), backend = %self.backend_kind());

        match self.dispatch(op, request).await {
            Ok((body, cookie)) => {
                log_operation_success!(locus.as_str());
                SessionResponse::ok(body, cookie)
            }
            Err(e) => {
                if e.is_declined() {
                    debug!(locus = %locus, category = e.category(), error = %e, "Declined session request");
                } else {
                    log_operation_error!(
                        locus.as_str(),
                        e,
                        category = e.category(),
                        recoverable = e.is_recoverable()
                    );
                }
                SessionResponse::from_error(&e, &locus)
            }
        }
    }

    async fn dispatch(
        &self,
        op: SessionOp,
        request: SessionRequest,
    ) -> SessionResult<(Value, Option<SessionCookie>)> {
        let client_ip = request.client_ip()?;

        match op {
            SessionOp::New => {
                let token = self.create_session(request.data.clone(), client_ip).await?;
                let cookie = self.cookie_for(&token);
                Ok((json!({ "session_id": token.session_id }), Some(cookie)))
            }
            SessionOp::Get => {
                let session_id = request
                    .effective_session_id()
                    .ok_or_else(|| SessionError::missing("session_id"))?;
                let data = self.get_session(session_id, client_ip).await?;
                Ok((json!({ "session_id": session_id, "data": data }), None))
            }
            SessionOp::Update => {
                let session_id = request
                    .effective_session_id()
                    .ok_or_else(|| SessionError::missing("session_id"))?;
                let data = request
                    .data
                    .clone()
                    .filter(|data| !data.is_empty())
                    .ok_or_else(|| SessionError::missing("data"))?;
                let data = self.update_session(session_id, client_ip, data).await?;
                Ok((json!({ "session_id": session_id, "data": data }), None))
            }
        }
    }
}
