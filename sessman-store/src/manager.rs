//! Session Manager - backend-agnostic session facade
//!
//! Owns the backend configuration and cookie policy, and opens the configured
//! backend lazily on first use.

use crate::clock::{system_clock, SharedClock};
use crate::errors::{SessionError, SessionResult};
use crate::storage::{BackendKind, SessionBackend};
use crate::types::{SessionCookie, SessionData, SessionToken};
use sessman_core::SessmanConfig;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Session manager over one storage backend
pub struct SessionManager {
    /// Full configuration, including the backend selection
    config: SessmanConfig,
    /// Time source handed to the backend and used for cookie expiry
    clock: SharedClock,
    /// Opened on first use
    backend: OnceCell<Arc<dyn SessionBackend>>,
}

impl SessionManager {
    /// Create a manager; nothing is opened until the first operation
    pub fn new(config: SessmanConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            backend: OnceCell::new(),
        }
    }

    /// Use a manager over an already opened backend
    pub fn with_backend(config: SessmanConfig, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            config,
            clock: system_clock(),
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    /// Replace the time source; must be called before the backend is opened
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SessmanConfig {
        &self.config
    }

    pub fn ttl_secs(&self) -> u64 {
        self.config.session.ttl_secs
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.config.session.backend
    }

    /// Open the backend now instead of on the first request
    pub async fn initialize(&self) -> SessionResult<()> {
        self.backend().await.map(|_| ())
    }

    /// The opened backend, opening it exactly once
    pub async fn backend(&self) -> SessionResult<&Arc<dyn SessionBackend>> {
        self.backend
            .get_or_try_init(|| self.open_backend())
            .await
    }

    async fn open_backend(&self) -> SessionResult<Arc<dyn SessionBackend>> {
        info!(
            "Opening {} session backend (ttl {}s)",
            self.config.session.backend, self.config.session.ttl_secs
        );

        match self.config.session.backend {
            #[cfg(feature = "sqlite")]
            BackendKind::Relational => {
                let config = crate::sqlite::RelationalConfig::from_config(&self.config)?;
                let backend =
                    crate::sqlite::SqliteBackend::open(config, Arc::clone(&self.clock)).await?;
                Ok(Arc::new(backend))
            }
            #[cfg(feature = "mongodb")]
            BackendKind::Document => {
                let config = crate::document::DocumentConfig::from_config(&self.config)?;
                let backend =
                    crate::document::MongoBackend::connect(config, Arc::clone(&self.clock))
                        .await?;
                Ok(Arc::new(backend))
            }
            #[allow(unreachable_patterns)]
            other => Err(SessionError::invalid_argument(
                "backend",
                format!("{} support is not compiled into this build", other),
            )),
        }
    }

    /// Start a new session; `data` defaults to an empty payload
    pub async fn create_session(
        &self,
        data: Option<SessionData>,
        client_ip: &str,
    ) -> SessionResult<SessionToken> {
        let backend = self.backend().await?;
        let session_id = backend.create(data.unwrap_or_default(), client_ip).await?;

        info!("Created session {} for {}", session_id, client_ip);
        Ok(SessionToken::new(
            session_id,
            self.clock.now(),
            self.config.session.ttl_secs,
        ))
    }

    /// Load a live session and extend its life
    pub async fn get_session(&self, session_id: &str, client_ip: &str) -> SessionResult<SessionData> {
        let backend = self.backend().await?;
        backend.get(session_id, client_ip).await
    }

    /// Replace the payload of a live session
    pub async fn update_session(
        &self,
        session_id: &str,
        client_ip: &str,
        data: SessionData,
    ) -> SessionResult<SessionData> {
        let backend = self.backend().await?;
        backend.update(session_id, client_ip, data).await
    }

    /// Cookie that hands `token` back to the client
    pub fn cookie_for(&self, token: &SessionToken) -> SessionCookie {
        token.cookie(&self.config.session.cookie_name)
    }

    /// True once the opened backend has gone fatal
    pub fn is_fatal(&self) -> bool {
        self.backend
            .get()
            .map(|backend| backend.is_fatal())
            .unwrap_or(false)
    }

    /// Stop background work owned through this manager's backend
    pub async fn terminate(&self) {
        match self.backend.get() {
            Some(backend) => {
                backend.shutdown().await;
                info!("Session manager terminated");
            }
            None => debug!("Session manager terminated before any backend was opened"),
        }
    }
}
