//! MongoDB backend tests against a live server
//!
//! Run with `cargo test -- --ignored` and:
//! `SESSMAN_TEST_MONGODB_URL` (host:port), plus optional
//! `SESSMAN_TEST_MONGODB_DATABASE`, `SESSMAN_TEST_MONGODB_USERNAME` and
//! `SESSMAN_TEST_MONGODB_PASSWORD`.

#![cfg(feature = "mongodb")]

use serde_json::json;
use sessman_core::RetryConfig;
use sessman_store::{
    system_clock, DocumentConfig, MongoBackend, SessionBackend, SessionData, SessionError,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn connect(ttl_secs: u64) -> MongoBackend {
    let config = DocumentConfig {
        server_url: env_or("SESSMAN_TEST_MONGODB_URL", "localhost:27017"),
        database: env_or("SESSMAN_TEST_MONGODB_DATABASE", "sessman_test"),
        username: env_or("SESSMAN_TEST_MONGODB_USERNAME", "sessman"),
        password: env_or("SESSMAN_TEST_MONGODB_PASSWORD", "sessman"),
        collection: format!("sessions_{}", uuid::Uuid::new_v4().simple()),
        ttl_secs,
        max_consecutive_failures: 5,
        retry: RetryConfig::no_retry(),
    };
    MongoBackend::connect(config, system_clock()).await.unwrap()
}

fn data(value: serde_json::Value) -> SessionData {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
#[ignore = "requires a MongoDB server"]
async fn test_example_scenario() {
    let backend = connect(3600).await;

    let id = backend.create(data(json!({"lang": "en"})), "10.0.0.5").await.unwrap();
    assert_eq!(
        backend.get(&id, "10.0.0.5").await.unwrap(),
        data(json!({"lang": "en"}))
    );
    assert_eq!(
        backend
            .update(&id, "10.0.0.5", data(json!({"lang": "fr"})))
            .await
            .unwrap(),
        data(json!({"lang": "fr"}))
    );
    assert!(matches!(
        backend.get(&id, "10.0.0.9").await,
        Err(SessionError::NotFound { .. })
    ));

    backend.health_check().await.unwrap();
    backend.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a MongoDB server"]
async fn test_update_of_unknown_session_is_not_found() {
    let backend = connect(3600).await;
    let err = backend
        .update("never-created", "10.0.0.5", data(json!({"a": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound { .. }));
    backend.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a MongoDB server"]
async fn test_expired_document_is_hidden_before_ttl_monitor_runs() {
    let backend = connect(1).await;
    let id = backend.create(SessionData::new(), "10.0.0.5").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    assert!(matches!(
        backend.get(&id, "10.0.0.5").await,
        Err(SessionError::NotFound { .. })
    ));
    backend.shutdown().await;
}
