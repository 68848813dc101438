//! Document backend over MongoDB
//!
//! Expiry is delegated to a server-side TTL index. Reads and writes are a
//! single `findOneAndUpdate` each, atomic per document, so no client-side lock
//! is needed.

use crate::clock::SharedClock;
use crate::codec;
use crate::errors::{SessionError, SessionResult};
use crate::health::FailureTracker;
use crate::storage::{
    require_client_ip, require_data, require_session_id, require_ttl, BackendKind,
    SessionBackend,
};
use crate::types::{expiry_cutoff, SessionData, SessionRecord};
use async_trait::async_trait;
use futures::{FutureExt, TryStreamExt};
use mongodb::bson::{doc, DateTime, Document};
use mongodb::error::ErrorKind as MongoErrorKind;
use mongodb::options::{
    ClientOptions, Credential, IndexOptions, ReturnDocument, ServerAddress,
};
use mongodb::{Client, Collection, Database, IndexModel};
use sessman_core::{retry_async, RetryConfig, SessmanConfig};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field the TTL index is anchored on
pub const EXPIRY_FIELD: &str = "updatedAt";
pub const TTL_INDEX_NAME: &str = "session_ttl";

/// Settings for [`MongoBackend::connect`]
#[derive(Clone)]
pub struct DocumentConfig {
    /// host:port
    pub server_url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub collection: String,
    pub ttl_secs: u64,
    pub max_consecutive_failures: u32,
    pub retry: RetryConfig,
}

impl fmt::Debug for DocumentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentConfig")
            .field("server_url", &self.server_url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("collection", &self.collection)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl DocumentConfig {
    pub fn from_config(config: &SessmanConfig) -> SessionResult<Self> {
        let mongo = &config.mongodb;
        let database = mongo
            .database
            .clone()
            .ok_or_else(|| SessionError::missing("mongodb.database"))?;
        let username = mongo
            .username
            .clone()
            .ok_or_else(|| SessionError::missing("mongodb.username"))?;
        let password = mongo
            .password
            .clone()
            .ok_or_else(|| SessionError::missing("mongodb.password"))?;

        Ok(Self {
            server_url: mongo.server_url.clone(),
            database,
            username,
            password,
            collection: mongo.collection.clone(),
            ttl_secs: config.session.ttl_secs,
            max_consecutive_failures: mongo.max_consecutive_failures,
            retry: RetryConfig::from(&config.retry),
        })
    }
}

fn bson_time(epoch_secs: i64) -> DateTime {
    DateTime::from_millis(epoch_secs.saturating_mul(1000))
}

/// Document for a freshly created session; `encoded` is its payload
pub fn new_document(record: &SessionRecord, encoded: &str) -> Document {
    doc! {
        "_id": record.session_id.as_str(),
        "client_ip": record.client_ip.as_str(),
        "createdAt": bson_time(record.created_at),
        "updatedAt": bson_time(record.last_touched_at),
        "data": encoded,
    }
}

/// Matches the session only while it is live at `now`
pub fn live_filter(session_id: &str, client_ip: &str, now: i64, ttl_secs: u64) -> Document {
    doc! {
        "_id": session_id,
        "client_ip": client_ip,
        "updatedAt": { "$gt": bson_time(expiry_cutoff(now, ttl_secs)) },
    }
}

pub fn touch_update(now: i64) -> Document {
    doc! { "$set": { "updatedAt": bson_time(now) } }
}

pub fn replace_data_update(encoded: &str, now: i64) -> Document {
    doc! { "$set": { "data": encoded, "updatedAt": bson_time(now) } }
}

pub fn ttl_index(ttl_secs: u64) -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "updatedAt": 1 })
        .options(
            IndexOptions::builder()
                .name(TTL_INDEX_NAME.to_string())
                .expire_after(Duration::from_secs(ttl_secs))
                .build(),
        )
        .build()
}

/// Decode the payload of a stored session document
pub fn document_data(document: &Document) -> SessionResult<SessionData> {
    let encoded = document.get_str("data").map_err(|e| {
        SessionError::unavailable(format!("session document has no data string: {}", e))
    })?;
    codec::decode(encoded)
}

/// Session backend over a MongoDB collection
#[derive(Clone)]
pub struct MongoBackend {
    client: Client,
    database: Database,
    collection: Collection<Document>,
    ttl_secs: u64,
    clock: SharedClock,
    tracker: std::sync::Arc<FailureTracker>,
}

impl fmt::Debug for MongoBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoBackend")
            .field("database", &self.database.name())
            .field("collection", &self.collection.name())
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl MongoBackend {
    /// Connect, verify the server answers, and ensure the TTL index
    pub async fn connect(config: DocumentConfig, clock: SharedClock) -> SessionResult<Self> {
        require_ttl(config.ttl_secs)?;
        if config.collection.trim().is_empty() {
            return Err(SessionError::missing("collection"));
        }

        let address = ServerAddress::parse(&config.server_url).map_err(|e| {
            SessionError::invalid_argument(
                "server_url",
                format!("'{}' is not host:port: {}", config.server_url, e),
            )
        })?;

        let credential = Credential::builder()
            .username(config.username.clone())
            .password(config.password.clone())
            .source(config.database.clone())
            .build();

        let options = ClientOptions::builder()
            .hosts(vec![address])
            .credential(credential)
            .app_name("sessman".to_string())
            .server_selection_timeout(Duration::from_secs(5))
            .build();

        let client = Client::with_options(options).map_err(|e| {
            SessionError::unavailable(format!(
                "Cannot create MongoDB client for {}: {}",
                config.server_url, e
            ))
        })?;
        let database = client.database(&config.database);

        retry_async(
            || {
                let database = database.clone();
                async move { database.run_command(doc! { "ping": 1 }).await }.boxed()
            },
            &config.retry,
            "mongodb_connect",
        )
        .await
        .map_err(|e| {
            SessionError::unavailable(format!(
                "Cannot connect to MongoDB at {}: {}",
                config.server_url, e
            ))
        })?;

        let collection = database.collection::<Document>(&config.collection);
        ensure_ttl_index(&database, &collection, config.ttl_secs).await?;

        info!(
            "MongoDB session store ready: {}/{}.{} (ttl {}s)",
            config.server_url, config.database, config.collection, config.ttl_secs
        );

        Ok(Self {
            client,
            database,
            collection,
            ttl_secs: config.ttl_secs,
            clock,
            tracker: std::sync::Arc::new(FailureTracker::new(
                format!("mongodb:{}", config.server_url),
                config.max_consecutive_failures,
            )),
        })
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
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

    /// Feed a driver result into the failure tracker
    fn observe<T>(&self, operation: &str, result: Result<T, mongodb::error::Error>) -> SessionResult<T> {
        match result {
            Ok(value) => {
                self.tracker.record_success();
                Ok(value)
            }
            Err(e) => {
                warn!(
                    backend = %self.tracker.name(),
                    operation = operation,
                    error = %e,
                    "MongoDB operation failed"
                );
                let message = e.to_string();
                if self.tracker.record_failure() {
                    Err(SessionError::fatal(message))
                } else {
                    Err(SessionError::unavailable(message))
                }
            }
        }
    }

    async fn find_and_modify(
        &self,
        operation: &str,
        session_id: &str,
        client_ip: &str,
        update: Document,
        now: i64,
    ) -> SessionResult<Option<Document>> {
        let result = self
            .collection
            .find_one_and_update(live_filter(session_id, client_ip, now, self.ttl_secs), update)
            .return_document(ReturnDocument::After)
            .await;
        self.observe(operation, result)
    }
}

fn index_name(index: &IndexModel) -> Option<&str> {
    index.options.as_ref().and_then(|o| o.name.as_deref())
}

/// Existing indexes that block creating ours: our name on another key, or
/// our key under another name
pub fn conflicting_indexes(existing: &[IndexModel]) -> Vec<String> {
    let expected = doc! { "updatedAt": 1 };
    existing
        .iter()
        .filter_map(|index| {
            let name = index_name(index)?;
            let same_name = name == TTL_INDEX_NAME;
            let same_keys = index.keys == expected;
            (same_name != same_keys).then(|| name.to_string())
        })
        .collect()
}

/// TTL indexes other than ours, each of which would expire sessions on its own key
pub fn foreign_ttl_indexes(existing: &[IndexModel]) -> Vec<String> {
    existing
        .iter()
        .filter(|index| index.options.as_ref().is_some_and(|o| o.expire_after.is_some()))
        .filter_map(index_name)
        .filter(|name| *name != TTL_INDEX_NAME)
        .map(str::to_string)
        .collect()
}

fn command_code(error: &mongodb::error::Error) -> Option<i32> {
    match *error.kind {
        MongoErrorKind::Command(ref command) => Some(command.code),
        _ => None,
    }
}

async fn existing_indexes(collection: &Collection<Document>) -> SessionResult<Vec<IndexModel>> {
    match collection.list_indexes().await {
        Ok(cursor) => Ok(cursor.try_collect::<Vec<_>>().await?),
        // NamespaceNotFound: the collection does not exist yet
        Err(e) if command_code(&e) == Some(26) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn ensure_ttl_index(
    database: &Database,
    collection: &Collection<Document>,
    ttl_secs: u64,
) -> SessionResult<()> {
    let existing = existing_indexes(collection).await?;

    for name in foreign_ttl_indexes(&existing) {
        warn!(
            "Collection {} has another TTL index {}; sessions may expire before their {} anchor says",
            collection.name(),
            name,
            EXPIRY_FIELD
        );
    }

    for name in conflicting_indexes(&existing) {
        warn!(
            "Dropping index {} on {}, it conflicts with the {} TTL index",
            name,
            collection.name(),
            TTL_INDEX_NAME
        );
        collection.drop_index(name).await?;
    }

    match collection.create_index(ttl_index(ttl_secs)).await {
        Ok(_) => {
            debug!(
                "TTL index on {}.{} expires after {}s",
                collection.name(),
                EXPIRY_FIELD,
                ttl_secs
            );
            Ok(())
        }
        // IndexOptionsConflict: same name and key, another expiry
        Err(e) if command_code(&e) == Some(85) => {
            warn!(
                "TTL index on {} exists with different options, updating expiry to {}s",
                collection.name(),
                ttl_secs
            );
            database
                .run_command(doc! {
                    "collMod": collection.name(),
                    "index": {
                        "name": TTL_INDEX_NAME,
                        "expireAfterSeconds": i64::try_from(ttl_secs).unwrap_or(i64::MAX),
                    },
                })
                .await?;
            Ok(())
        }
        Err(e) => Err(SessionError::unavailable(format!(
            "Cannot create TTL index on {}: {}",
            collection.name(),
            e
        ))),
    }
}

#[async_trait]
impl SessionBackend for MongoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn create(&self, data: SessionData, client_ip: &str) -> SessionResult<String> {
        require_client_ip(client_ip)?;
        self.ensure_usable()?;

        let encoded = codec::encode(&data)?;
        let record = SessionRecord::new(client_ip.to_string(), data, self.clock.now());

        let result = self.collection.insert_one(new_document(&record, &encoded)).await;
        self.observe("create", result)?;

        debug!("Created session {} in MongoDB storage", record.session_id);
        Ok(record.session_id)
    }

    async fn get(&self, session_id: &str, client_ip: &str) -> SessionResult<SessionData> {
        require_session_id(session_id)?;
        require_client_ip(client_ip)?;
        self.ensure_usable()?;

        let now = self.clock.now();
        let document = self
            .find_and_modify("get", session_id, client_ip, touch_update(now), now)
            .await?
            .ok_or_else(|| SessionError::not_found(session_id))?;

        debug!("Loaded session {} from MongoDB storage", session_id);
        document_data(&document)
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
        self.ensure_usable()?;

        let encoded = codec::encode(&data)?;
        let now = self.clock.now();
        let document = self
            .find_and_modify(
                "update",
                session_id,
                client_ip,
                replace_data_update(&encoded, now),
                now,
            )
            .await?
            .ok_or_else(|| SessionError::not_found(session_id))?;

        debug!("Updated session {} in MongoDB storage", session_id);
        document_data(&document)
    }

    async fn health_check(&self) -> SessionResult<()> {
        self.ensure_usable()?;
        let result = self.database.run_command(doc! { "ping": 1 }).await;
        self.observe("health_check", result).map(|_| ())
    }

    fn is_fatal(&self) -> bool {
        self.tracker.is_fatal()
    }

    async fn shutdown(&self) {
        // The TTL monitor is server-side; only the client pool needs closing
        self.client.clone().shutdown().await;
        info!("MongoDB session client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(now: i64) -> SessionRecord {
        SessionRecord::new("10.0.0.5".to_string(), SessionData::new(), now)
    }

    #[test]
    fn test_new_document_layout() {
        let record = record(1_000);
        let document = new_document(&record, "e30=");
        assert_eq!(document.get_str("_id").unwrap(), record.session_id);
        assert_eq!(document.get_str("client_ip").unwrap(), "10.0.0.5");
        assert_eq!(document.get_str("data").unwrap(), "e30=");
        assert_eq!(
            document.get_datetime("createdAt").unwrap(),
            document.get_datetime(EXPIRY_FIELD).unwrap()
        );
        assert_eq!(
            document.get_datetime("createdAt").unwrap().timestamp_millis(),
            1_000_000
        );
    }

    #[test]
    fn test_live_filter_scopes_identity_and_cutoff() {
        let filter = live_filter("abc", "10.0.0.5", 1_000, 100);
        assert_eq!(filter.get_str("_id").unwrap(), "abc");
        assert_eq!(filter.get_str("client_ip").unwrap(), "10.0.0.5");

        let bound = filter.get_document(EXPIRY_FIELD).unwrap();
        assert_eq!(
            bound.get_datetime("$gt").unwrap().timestamp_millis(),
            900_000
        );
    }

    #[test]
    fn test_updates_refresh_expiry_anchor() {
        let touch = touch_update(42);
        let set = touch.get_document("$set").unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get_datetime(EXPIRY_FIELD).unwrap().timestamp_millis(), 42_000);

        let replace = replace_data_update("e30=", 42);
        let set = replace.get_document("$set").unwrap();
        assert_eq!(set.get_str("data").unwrap(), "e30=");
        assert!(set.contains_key(EXPIRY_FIELD));
        assert!(!set.contains_key("createdAt"));
    }

    #[test]
    fn test_ttl_index_options() {
        let index = ttl_index(3600);
        assert_eq!(index.keys, doc! { "updatedAt": 1 });
        let options = index.options.unwrap();
        assert_eq!(options.expire_after, Some(Duration::from_secs(3600)));
        assert_eq!(options.name.as_deref(), Some(TTL_INDEX_NAME));
    }

    fn named_index(keys: Document, name: &str, expire_after: Option<u64>) -> IndexModel {
        let mut options = IndexOptions::default();
        options.name = Some(name.to_string());
        options.expire_after = expire_after.map(Duration::from_secs);
        IndexModel::builder().keys(keys).options(options).build()
    }

    #[test]
    fn test_index_on_another_anchor_is_replaced() {
        let existing = vec![
            named_index(doc! { "_id": 1 }, "_id_", None),
            named_index(doc! { "createdAt": 1 }, TTL_INDEX_NAME, Some(3600)),
        ];
        assert_eq!(conflicting_indexes(&existing), vec![TTL_INDEX_NAME.to_string()]);
        assert!(foreign_ttl_indexes(&existing).is_empty());
    }

    #[test]
    fn test_expiry_key_under_another_name_is_replaced() {
        let existing = vec![named_index(doc! { "updatedAt": 1 }, "updatedAt_1", None)];
        assert_eq!(conflicting_indexes(&existing), vec!["updatedAt_1".to_string()]);
    }

    #[test]
    fn test_matching_index_is_kept_and_stray_ttl_reported() {
        let existing = vec![
            named_index(doc! { "_id": 1 }, "_id_", None),
            ttl_index(60),
            named_index(doc! { "createdAt": 1 }, "createdAt_1", Some(86400)),
        ];
        assert!(conflicting_indexes(&existing).is_empty());
        assert_eq!(foreign_ttl_indexes(&existing), vec!["createdAt_1".to_string()]);
    }

    #[test]
    fn test_document_data_decodes_payload() {
        let data = json!({"lang": "en"}).as_object().cloned().unwrap();
        let encoded = codec::encode(&data).unwrap();
        let document = new_document(&record(0), &encoded);
        assert_eq!(document_data(&document).unwrap(), data);

        let broken = doc! { "_id": "abc", "data": 7 };
        assert!(matches!(
            document_data(&broken),
            Err(SessionError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn test_config_requires_credentials() {
        let mut config = SessmanConfig::default();
        config.mongodb.database = Some("app".to_string());
        config.mongodb.username = Some("svc".to_string());

        let err = DocumentConfig::from_config(&config).unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument { ref field, .. } if field == "mongodb.password"));

        config.mongodb.password = Some("secret".to_string());
        let built = DocumentConfig::from_config(&config).unwrap();
        assert_eq!(built.collection, "sessions");
        assert!(!format!("{:?}", built).contains("secret"));
    }
}
