//! Session manager and request handling over the SQLite backend

use serde_json::json;
use sessman_core::{BackendKind, SessmanConfig};
use sessman_store::{
    ManualClock, ResponseStatus, SessionData, SessionError, SessionManager, SessionRequest,
};
use tempfile::TempDir;

fn config(dir: &TempDir, ttl_secs: u64) -> SessmanConfig {
    let mut config = SessmanConfig::default();
    config.session.backend = BackendKind::Relational;
    config.session.ttl_secs = ttl_secs;
    config.sqlite.database = Some(
        dir.path()
            .join("manager.db")
            .to_string_lossy()
            .into_owned(),
    );
    config
}

fn data(value: serde_json::Value) -> SessionData {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_example_scenario() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(config(&dir, 3600)).with_clock(ManualClock::new(0));

    let created = manager
        .handle(
            SessionRequest::new("new")
                .with_client_ip("10.0.0.5")
                .with_data(data(json!({"lang": "en"}))),
        )
        .await;
    assert_eq!(created.status, ResponseStatus::Ok);
    let session_id = created.body["session_id"].as_str().unwrap().to_string();
    assert_eq!(created.body, json!({ "session_id": session_id }));

    let fetched = manager
        .handle(
            SessionRequest::new("get")
                .with_session_id(&session_id)
                .with_client_ip("10.0.0.5"),
        )
        .await;
    assert_eq!(
        fetched.body,
        json!({ "session_id": session_id, "data": {"lang": "en"} })
    );

    let updated = manager
        .handle(
            SessionRequest::new("update")
                .with_session_id(&session_id)
                .with_client_ip("10.0.0.5")
                .with_data(data(json!({"lang": "fr"}))),
        )
        .await;
    assert_eq!(
        updated.body,
        json!({ "session_id": session_id, "data": {"lang": "fr"} })
    );

    let foreign = manager
        .handle(
            SessionRequest::new("get")
                .with_session_id(&session_id)
                .with_client_ip("10.0.0.9"),
        )
        .await;
    assert_eq!(foreign.status, ResponseStatus::Declined);
    assert_eq!(foreign.http_status, 404);
    assert_eq!(foreign.body["locus"], "session.get");

    manager.terminate().await;
}

#[tokio::test]
async fn test_new_sets_session_cookie() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(config(&dir, 86400)).with_clock(ManualClock::new(0));

    let response = manager
        .handle(SessionRequest::new("new").with_client_ip("10.0.0.5"))
        .await;
    let cookie = response.cookie.unwrap();

    assert_eq!(cookie.name, "PS_SESSID");
    assert_eq!(cookie.value, response.body["session_id"].as_str().unwrap());
    assert_eq!(
        cookie.to_header_value(),
        format!(
            "PS_SESSID={}; Expires=Fri, 02 Jan 1970 00:00:00 GMT; Path=/; HttpOnly",
            cookie.value
        )
    );

    manager.terminate().await;
}

#[tokio::test]
async fn test_cookie_session_id_is_used_when_no_explicit_id() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(config(&dir, 3600)).with_clock(ManualClock::new(0));

    let token = manager
        .create_session(Some(data(json!({"cart": [1, 2]}))), "10.0.0.5")
        .await
        .unwrap();

    let response = manager
        .handle(
            SessionRequest::new("get")
                .with_cookie(&token.session_id)
                .with_client_ip("10.0.0.5"),
        )
        .await;
    assert!(response.is_ok());
    assert_eq!(response.body["data"], json!({"cart": [1, 2]}));
    assert!(response.cookie.is_none());

    manager.terminate().await;
}

#[tokio::test]
async fn test_declined_requests() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(config(&dir, 3600)).with_clock(ManualClock::new(0));

    let unknown_op = manager
        .handle(SessionRequest::new("delete").with_client_ip("10.0.0.5"))
        .await;
    assert_eq!(unknown_op.status, ResponseStatus::Declined);
    assert_eq!(unknown_op.http_status, 400);

    let no_ip = manager.handle(SessionRequest::new("new")).await;
    assert_eq!(no_ip.http_status, 400);
    assert_eq!(no_ip.body["error"], "required argument, client_ip, not set");

    let no_id = manager
        .handle(SessionRequest::new("get").with_client_ip("10.0.0.5"))
        .await;
    assert_eq!(no_id.http_status, 400);

    let update_without_new = manager
        .handle(
            SessionRequest::new("update")
                .with_session_id("never-created")
                .with_client_ip("10.0.0.5")
                .with_data(data(json!({"a": 1}))),
        )
        .await;
    assert_eq!(update_without_new.status, ResponseStatus::Declined);
    assert_eq!(
        update_without_new.body["error"],
        "Session ID never-created not found."
    );

    manager.terminate().await;
}

#[tokio::test]
async fn test_expired_session_reads_as_never_existed() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(0);
    let manager = SessionManager::new(config(&dir, 60)).with_clock(clock.clone());

    let token = manager.create_session(None, "10.0.0.5").await.unwrap();
    clock.set(61);

    let expired = manager
        .get_session(&token.session_id, "10.0.0.5")
        .await
        .unwrap_err();
    let never = manager.get_session("no-such-id", "10.0.0.5").await.unwrap_err();
    assert_eq!(expired.kind(), never.kind());
    assert!(matches!(expired, SessionError::NotFound { .. }));

    manager.terminate().await;
}

#[tokio::test]
async fn test_backend_opens_once_and_terminate_stops_reaper() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(config(&dir, 3600));

    manager.initialize().await.unwrap();
    let first = manager.backend().await.unwrap().clone();
    manager.initialize().await.unwrap();
    let second = manager.backend().await.unwrap().clone();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.kind(), BackendKind::Relational);

    let direct = sessman_store::SqliteBackend::open(
        sessman_store::RelationalConfig::from_config(manager.config()).unwrap(),
        sessman_store::system_clock(),
    )
    .await
    .unwrap();
    assert!(direct.reaper().unwrap().is_running());

    manager.terminate().await;
    assert!(!direct.reaper().unwrap().is_running());
    assert!(!manager.is_fatal());
}
