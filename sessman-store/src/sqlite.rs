//! Relational backend over an embedded SQLite file
//!
//! Every backend opened on the same file and table shares one connection, one
//! lock and one reaper. All statements, the reaper's sweep included, run while
//! holding that lock.

use crate::clock::SharedClock;
use crate::codec;
use crate::errors::{SessionError, SessionResult};
use crate::health::FailureTracker;
use crate::reaper::{ReaperConfig, ReaperHandle, ReaperStatus, Sweeper};
use crate::storage::{
    require_client_ip, require_data, require_session_id, require_ttl, BackendKind,
    SessionBackend,
};
use crate::types::{expiry_cutoff, SessionData, SessionRecord};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use sessman_core::{is_valid_identifier, retry_async, RetryConfig, SessmanConfig};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type StoreKey = (PathBuf, String);

/// Open stores by absolute database path and table
static STORES: LazyLock<Mutex<HashMap<StoreKey, Weak<RelationalStore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Settings for [`SqliteBackend::open`]
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    pub database: PathBuf,
    pub table: String,
    pub ttl_secs: u64,
    pub sweep_interval: Duration,
    /// Consecutive failures tolerated before the store goes fatal
    pub max_consecutive_failures: u32,
    /// Backoff for opening the database file
    pub retry: RetryConfig,
    /// Run a reaper for the store, starting one if none is running
    pub start_reaper: bool,
}

impl RelationalConfig {
    pub fn new<P: Into<PathBuf>>(database: P) -> Self {
        Self {
            database: database.into(),
            table: "sessions".to_string(),
            ttl_secs: 86400,
            sweep_interval: Duration::from_secs(60),
            max_consecutive_failures: 50,
            retry: RetryConfig::default(),
            start_reaper: true,
        }
    }

    pub fn from_config(config: &SessmanConfig) -> SessionResult<Self> {
        let database = config
            .sqlite
            .database
            .as_deref()
            .ok_or_else(|| SessionError::missing("sqlite.database"))?;

        Ok(Self {
            database: PathBuf::from(database),
            table: config.sqlite.table.clone(),
            ttl_secs: config.session.ttl_secs,
            sweep_interval: Duration::from_secs(config.sqlite.sweep_interval_secs),
            max_consecutive_failures: config.sqlite.max_consecutive_failures,
            retry: RetryConfig::from(&config.retry),
            start_reaper: true,
        })
    }

    pub fn with_table<S: Into<String>>(mut self, table: S) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn without_reaper(mut self) -> Self {
        self.start_reaper = false;
        self
    }
}

struct Statements {
    create_table: String,
    create_index: String,
    insert: String,
    select: String,
    touch: String,
    update: String,
    purge: String,
    count: String,
}

impl Statements {
    /// `table` must already be a valid identifier
    fn new(table: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 timestamp INTEGER NOT NULL, \
                 session_id TEXT NOT NULL UNIQUE, \
                 client_ip TEXT NOT NULL, \
                 data TEXT NOT NULL)"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {table}_timestamp_idx ON {table} (timestamp)"
            ),
            insert: format!(
                "INSERT INTO {table} (timestamp, session_id, client_ip, data) VALUES (?, ?, ?, ?)"
            ),
            select: format!(
                "SELECT data FROM {table} WHERE session_id = ? AND client_ip = ? AND timestamp > ?"
            ),
            touch: format!(
                "UPDATE {table} SET timestamp = ? WHERE session_id = ? AND client_ip = ?"
            ),
            update: format!(
                "UPDATE {table} SET data = ?, timestamp = ? \
                 WHERE session_id = ? AND client_ip = ? AND timestamp > ?"
            ),
            purge: format!("DELETE FROM {table} WHERE timestamp < ?"),
            count: format!("SELECT COUNT(*) FROM {table}"),
        }
    }
}

/// State shared by every backend handle on one database file and table
struct RelationalStore {
    config: RelationalConfig,
    clock: SharedClock,
    sql: Statements,
    conn: Mutex<Option<SqliteConnection>>,
    tracker: FailureTracker,
    /// Replaced when a stopped store is reopened
    reaper: std::sync::Mutex<Option<Arc<ReaperHandle>>>,
}

impl RelationalStore {
    fn reaper_slot(&self) -> MutexGuard<'_, Option<Arc<ReaperHandle>>> {
        self.reaper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a reaper unless one is running or has already given up
    fn ensure_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper_slot();
        match slot.as_ref().map(|reaper| reaper.status()) {
            Some(ReaperStatus::Running) => return,
            Some(ReaperStatus::Failed { .. }) => {
                // The tracker was tripped when it failed, so the store stays fatal
                warn!(
                    "Reaper for {} has failed, not restarting it",
                    self.tracker.name()
                );
                return;
            }
            Some(ReaperStatus::Stopped) => {
                info!("Restarting stopped reaper for {}", self.tracker.name());
            }
            None => {}
        }

        let handle = ReaperHandle::spawn(
            Arc::downgrade(self),
            ReaperConfig {
                name: self.tracker.name().to_string(),
                interval: self.config.sweep_interval,
                max_consecutive_failures: self.config.max_consecutive_failures,
            },
        );
        *slot = Some(Arc::new(handle));
    }

    fn ensure_usable(&self) -> SessionResult<()> {
        if self.tracker.is_fatal() {
            return Err(SessionError::fatal(format!(
                "{} has exceeded its failure threshold",
                self.tracker.name()
            )));
        }
        Ok(())
    }

    /// Run `op` on the shared connection while holding the store lock
    ///
    /// A failed statement drops the connection so the next caller reconnects.
    async fn with_connection<T, F>(&self, operation: &'static str, op: F) -> SessionResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(
                &'c mut SqliteConnection,
                &'c Statements,
            ) -> BoxFuture<'c, SessionResult<T>>
            + Send,
    {
        self.ensure_usable()?;

        let mut slot = self.conn.lock().await;
        let conn = self.ready_connection(&mut slot).await?;
        let result = op(conn, &self.sql).await;

        match result {
            Ok(value) => {
                self.tracker.record_success();
                Ok(value)
            }
            Err(error) => {
                if let Some(stale) = slot.take() {
                    if let Err(e) = stale.close().await {
                        debug!("Error closing failed SQLite connection: {}", e);
                    }
                }
                Err(self.fail(operation, error))
            }
        }
    }

    /// Ping the held connection, reopening the file if it is missing or dead
    async fn ready_connection<'a>(
        &self,
        slot: &'a mut Option<SqliteConnection>,
    ) -> SessionResult<&'a mut SqliteConnection> {
        let healthy = match slot.as_mut() {
            Some(conn) => match conn.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "SQLite connection to {} failed its ping: {}",
                        self.config.database.display(),
                        e
                    );
                    false
                }
            },
            None => false,
        };

        if !healthy {
            if let Some(stale) = slot.take() {
                if let Err(e) = stale.close().await {
                    debug!("Error closing stale SQLite connection: {}", e);
                }
            }
            let conn = self
                .connect()
                .await
                .map_err(|error| self.fail("connect", error))?;
            return Ok(slot.insert(conn));
        }

        slot.as_mut()
            .ok_or_else(|| SessionError::unavailable("SQLite connection missing"))
    }

    async fn connect(&self) -> SessionResult<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(&self.config.database)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let conn = retry_async(
            || {
                let options = options.clone();
                async move { SqliteConnection::connect_with(&options).await }.boxed()
            },
            &self.config.retry,
            "sqlite_connect",
        )
        .await
        .map_err(|e| {
            SessionError::unavailable(format!(
                "Cannot open sqlite3 database {}: {}",
                self.config.database.display(),
                e
            ))
        })?;

        info!(
            "Opened SQLite session store at {}",
            self.config.database.display()
        );
        Ok(conn)
    }

    /// Count a failure and escalate the error once the tracker goes fatal
    fn fail(&self, operation: &str, error: SessionError) -> SessionError {
        warn!(
            backend = %self.tracker.name(),
            operation = operation,
            error = %error,
            "SQLite operation failed"
        );

        if !self.tracker.record_failure() {
            return error;
        }
        match error {
            SessionError::StorageUnavailable { message, .. } => SessionError::StorageUnavailable {
                message,
                fatal: true,
            },
            other => SessionError::fatal(other.to_string()),
        }
    }

    async fn ensure_schema(&self) -> SessionResult<()> {
        self.with_connection("ensure_schema", |conn, sql| {
            Box::pin(async move {
                sqlx::query(&sql.create_table).execute(&mut *conn).await?;
                sqlx::query(&sql.create_index).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .await
    }

    async fn purge_expired(&self) -> SessionResult<u64> {
        let clock = Arc::clone(&self.clock);
        let ttl_secs = self.config.ttl_secs;

        self.with_connection("purge_expired", move |conn, sql| {
            Box::pin(async move {
                let cutoff = expiry_cutoff(clock.now(), ttl_secs);
                let mut tx = conn.begin().await?;
                let result = sqlx::query(&sql.purge)
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            })
        })
        .await
    }

    async fn count(&self) -> SessionResult<u64> {
        let count = self
            .with_connection("count", |conn, sql| {
                Box::pin(async move {
                    let count: i64 = sqlx::query_scalar(&sql.count)
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok(count)
                })
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl Sweeper for RelationalStore {
    async fn sweep(&self) -> SessionResult<u64> {
        self.purge_expired().await
    }

    fn on_reaper_failure(&self, failure: &SessionError) {
        self.tracker.trip(&failure.to_string());
    }
}

/// Session backend over a SQLite file
#[derive(Clone)]
pub struct SqliteBackend {
    store: Arc<RelationalStore>,
}

impl fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("database", &self.store.config.database)
            .field("table", &self.store.config.table)
            .field("ttl_secs", &self.store.config.ttl_secs)
            .finish()
    }
}

impl SqliteBackend {
    /// Open (or join) the store for `config.database` and `config.table`
    ///
    /// The first open creates the schema and starts the reaper. Later opens
    /// of the same file and table share that store.
    pub async fn open(config: RelationalConfig, clock: SharedClock) -> SessionResult<Self> {
        if !is_valid_identifier(&config.table) {
            return Err(SessionError::invalid_argument(
                "table",
                format!("'{}' is not a valid SQL identifier", config.table),
            ));
        }
        require_ttl(config.ttl_secs)?;
        if config.sweep_interval.is_zero() {
            return Err(SessionError::invalid_argument(
                "sweep_interval",
                "must be greater than zero",
            ));
        }

        let database = std::path::absolute(&config.database).map_err(|e| {
            SessionError::invalid_argument(
                "database",
                format!("cannot resolve {}: {}", config.database.display(), e),
            )
        })?;
        let key = (database.clone(), config.table.clone());

        let mut stores = STORES.lock().await;
        stores.retain(|_, store| store.strong_count() > 0);

        if let Some(store) = stores.get(&key).and_then(Weak::upgrade) {
            if store.config.ttl_secs != config.ttl_secs {
                warn!(
                    "SQLite store {} is already open with ttl {}s, ignoring requested {}s",
                    database.display(),
                    store.config.ttl_secs,
                    config.ttl_secs
                );
            }
            debug!("Joining open SQLite store at {}", database.display());
            if config.start_reaper {
                store.ensure_reaper();
            }
            return Ok(Self { store });
        }

        if let Some(parent) = database.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SessionError::unavailable(format!(
                    "Cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tracker = FailureTracker::new(
            format!("sqlite:{}", database.display()),
            config.max_consecutive_failures,
        );
        let sql = Statements::new(&config.table);
        let store = Arc::new(RelationalStore {
            config: RelationalConfig {
                database,
                ..config
            },
            clock,
            sql,
            conn: Mutex::new(None),
            tracker,
            reaper: std::sync::Mutex::new(None),
        });

        store.ensure_schema().await?;

        if store.config.start_reaper {
            store.ensure_reaper();
        }

        stores.insert(key, Arc::downgrade(&store));
        info!(
            "SQLite session store ready: {} (table {}, ttl {}s)",
            store.config.database.display(),
            store.config.table,
            store.config.ttl_secs
        );

        Ok(Self { store })
    }

    /// Delete every expired row now, returning how many were removed
    pub async fn purge_expired(&self) -> SessionResult<u64> {
        self.store.purge_expired().await
    }

    /// Rows currently stored, live or not yet swept
    pub async fn count(&self) -> SessionResult<u64> {
        self.store.count().await
    }

    pub fn reaper_status(&self) -> Option<ReaperStatus> {
        self.store.reaper_slot().as_ref().map(|reaper| reaper.status())
    }

    /// The store's current reaper, if one was ever started
    pub fn reaper(&self) -> Option<Arc<ReaperHandle>> {
        self.store.reaper_slot().clone()
    }

    pub fn database(&self) -> &Path {
        &self.store.config.database
    }

    pub fn table(&self) -> &str {
        &self.store.config.table
    }

    pub fn ttl_secs(&self) -> u64 {
        self.store.config.ttl_secs
    }

    /// True when both handles use the same connection, lock and reaper
    pub fn shares_store_with(&self, other: &SqliteBackend) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

#[async_trait]
impl SessionBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn create(&self, data: SessionData, client_ip: &str) -> SessionResult<String> {
        require_client_ip(client_ip)?;

        let encoded = codec::encode(&data)?;
        let clock = Arc::clone(&self.store.clock);
        let ip = client_ip.to_string();

        let record = self
            .store
            .with_connection("create", move |conn, sql| {
                Box::pin(async move {
                    let record = SessionRecord::new(ip, data, clock.now());
                    let mut tx = conn.begin().await?;
                    sqlx::query(&sql.insert)
                        .bind(record.last_touched_at)
                        .bind(&record.session_id)
                        .bind(&record.client_ip)
                        .bind(&encoded)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(record)
                })
            })
            .await?;

        debug!("Created session {} in SQLite storage", record.session_id);
        Ok(record.session_id)
    }

    async fn get(&self, session_id: &str, client_ip: &str) -> SessionResult<SessionData> {
        require_session_id(session_id)?;
        require_client_ip(client_ip)?;

        let clock = Arc::clone(&self.store.clock);
        let ttl_secs = self.store.config.ttl_secs;
        let id = session_id.to_string();
        let ip = client_ip.to_string();

        let encoded = self
            .store
            .with_connection("get", move |conn, sql| {
                Box::pin(async move {
                    let now = clock.now();
                    let mut tx = conn.begin().await?;
                    let encoded: Option<String> = sqlx::query_scalar(&sql.select)
                        .bind(&id)
                        .bind(&ip)
                        .bind(expiry_cutoff(now, ttl_secs))
                        .fetch_optional(&mut *tx)
                        .await?;
                    if encoded.is_some() {
                        sqlx::query(&sql.touch)
                            .bind(now)
                            .bind(&id)
                            .bind(&ip)
                            .execute(&mut *tx)
                            .await?;
                    }
                    tx.commit().await?;
                    Ok(encoded)
                })
            })
            .await?;

        match encoded {
            Some(encoded) => {
                debug!("Loaded session {} from SQLite storage", session_id);
                codec::decode(&encoded)
            }
            None => Err(SessionError::not_found(session_id)),
        }
    }

    async fn update(
        &self,
        session_id: &str,
        client_ip: &str,
        data: SessionData,
    ) -> SessionResult<SessionData> {
        require_session_id(session_id)?;
        require_client_ip(client_ip)?;
        require_data(&data)?;

        let encoded = codec::encode(&data)?;
        let clock = Arc::clone(&self.store.clock);
        let ttl_secs = self.store.config.ttl_secs;
        let id = session_id.to_string();
        let ip = client_ip.to_string();

        let updated = self
            .store
            .with_connection("update", move |conn, sql| {
                Box::pin(async move {
                    let now = clock.now();
                    let mut tx = conn.begin().await?;
                    let result = sqlx::query(&sql.update)
                        .bind(&encoded)
                        .bind(now)
                        .bind(&id)
                        .bind(&ip)
                        .bind(expiry_cutoff(now, ttl_secs))
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;

        if updated == 0 {
            return Err(SessionError::not_found(session_id));
        }

        debug!("Updated session {} in SQLite storage", session_id);
        Ok(data)
    }

    async fn health_check(&self) -> SessionResult<()> {
        self.store
            .with_connection("health_check", |_conn, _sql| Box::pin(async { Ok(()) }))
            .await
    }

    fn is_fatal(&self) -> bool {
        self.store.tracker.is_fatal()
    }

    async fn shutdown(&self) {
        let reaper = self.store.reaper_slot().clone();
        if let Some(reaper) = reaper {
            reaper.stop_and_wait().await;
        }
        if let Some(conn) = self.store.conn.lock().await.take() {
            if let Err(e) = conn.close().await {
                debug!("Error closing SQLite connection: {}", e);
            }
        }
        info!(
            "SQLite session store {} shut down",
            self.store.config.database.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RelationalConfig {
        RelationalConfig::new(dir.path().join("sessions.db"))
            .with_ttl(100)
            .without_reaper()
    }

    fn data(value: serde_json::Value) -> SessionData {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_statements_use_table_name() {
        let sql = Statements::new("web_sessions");
        assert!(sql.create_table.starts_with("CREATE TABLE IF NOT EXISTS web_sessions ("));
        assert!(sql.create_index.contains("web_sessions_timestamp_idx"));
        assert!(sql.select.ends_with("timestamp > ?"));
        assert_eq!(sql.purge, "DELETE FROM web_sessions WHERE timestamp < ?");
    }

    #[tokio::test]
    async fn test_rejects_invalid_table_name() {
        let dir = TempDir::new().unwrap();
        let result = SqliteBackend::open(
            config(&dir).with_table("sessions; DROP TABLE users"),
            ManualClock::new(0),
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidArgument { ref field, .. }) if field == "table"
        ));
    }

    #[tokio::test]
    async fn test_creates_schema_and_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let backend = SqliteBackend::open(
            RelationalConfig::new(&path).without_reaper(),
            ManualClock::new(0),
        )
        .await
        .unwrap();

        assert!(path.exists());
        assert!(backend.database().is_absolute());
        assert_eq!(backend.count().await.unwrap(), 0);
        assert!(backend.reaper_status().is_none());
        backend.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_refreshes_timestamp() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let backend = SqliteBackend::open(config(&dir), clock.clone()).await.unwrap();

        let id = backend
            .create(data(json!({"user": "ada"})), "10.0.0.5")
            .await
            .unwrap();

        clock.set(1_090);
        let loaded = backend.get(&id, "10.0.0.5").await.unwrap();
        assert_eq!(loaded.get("user"), Some(&json!("ada")));

        // Would be expired without the touch at 1090
        clock.set(1_150);
        assert!(backend.get(&id, "10.0.0.5").await.is_ok());

        clock.set(1_250);
        assert!(matches!(
            backend.get(&id, "10.0.0.5").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(500);
        let backend = SqliteBackend::open(config(&dir), clock).await.unwrap();

        backend
            .store
            .with_connection("seed", |conn, _sql| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO sessions (timestamp, session_id, client_ip, data) \
                         VALUES (500, 'broken', '10.0.0.5', '***')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let err = backend.get("broken", "10.0.0.5").await.unwrap_err();
        assert!(matches!(err, SessionError::StorageUnavailable { fatal: false, .. }));
        assert!(!backend.is_fatal());
    }

    #[tokio::test]
    async fn test_statement_failures_go_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir).with_table("fragile");
        cfg.max_consecutive_failures = 1;
        let backend = SqliteBackend::open(cfg, ManualClock::new(0)).await.unwrap();

        backend
            .store
            .with_connection("drop_table", |conn, _sql| {
                Box::pin(async move {
                    sqlx::query("DROP TABLE fragile").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let first = backend.count().await.unwrap_err();
        assert!(matches!(first, SessionError::StorageUnavailable { fatal: false, .. }));

        let second = backend.count().await.unwrap_err();
        assert!(second.is_fatal());
        assert!(backend.is_fatal());

        // Refused without touching the database
        let third = backend.create(SessionData::new(), "10.0.0.5").await.unwrap_err();
        assert!(third.is_fatal());
    }
}
