//! Integration tests for sessman-core infrastructure

use sessman_core::{
    config_error, init_logging, validation_error, BackendKind, CoreError, LogFormat,
    LoggingConfig, SessmanConfig,
};

#[test]
fn test_error_macros() {
    let config_err = config_error!("Invalid config", "test_component");
    match &config_err {
        CoreError::Config { message, context, .. } => {
            assert_eq!(message, "Invalid config");
            assert_eq!(context.component, "test_component");
            assert!(!context.error_id.is_empty());
            assert!(!context.suggestions.is_empty());
        }
        _ => panic!("Expected Config error"),
    }
    assert!(config_err.context().is_some());

    // Should not panic
    config_err.log();

    let validation_err = validation_error!("Invalid field value", "session.ttl_secs", "validator");
    match validation_err {
        CoreError::Validation { ref field, ref context, .. } => {
            assert_eq!(field.as_deref(), Some("session.ttl_secs"));
            assert_eq!(context.component, "validator");
        }
        _ => panic!("Expected Validation error"),
    }
    validation_err.log();
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessman.toml");

    let mut config = SessmanConfig::default();
    config.session.ttl_secs = 1800;
    config.sqlite.database = Some(dir.path().join("sessions.db").display().to_string());
    config.sqlite.sweep_interval_secs = 5;
    config.save_to_file(&path).unwrap();

    let loaded = SessmanConfig::from_file(&path).unwrap();
    assert_eq!(loaded.session.ttl_secs, 1800);
    assert_eq!(loaded.sqlite.sweep_interval_secs, 5);
    assert_eq!(loaded.sqlite.database, config.sqlite.database);
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_layered_load_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessman.toml");
    std::fs::write(
        &path,
        r#"
[session]
backend = "mongodb"
ttl_secs = 120

[mongodb]
server_url = "db.internal:27017"
database = "app"
username = "svc"
password = "pw"
collection = "web_sessions"
"#,
    )
    .unwrap();

    let config = SessmanConfig::load(Some(&path)).unwrap();
    assert_eq!(config.session.backend, BackendKind::Document);
    assert_eq!(config.session.ttl_secs, 120);
    assert_eq!(config.mongodb.server_url, "db.internal:27017");
    assert_eq!(config.mongodb.collection, "web_sessions");
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = SessmanConfig::load(Some(&dir.path().join("absent.toml")));
    assert!(matches!(result, Err(CoreError::Config { .. })));
}

#[test]
fn test_logging_initialization() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Compact,
        filter_directives: vec!["sessman_core=debug".to_string()],
        ..LoggingConfig::default()
    };

    // The first call installs the subscriber, a second one must fail cleanly
    let _ = init_logging(&config);
    assert!(init_logging(&config).is_err());
}

#[test]
fn test_bad_filter_directive() {
    let config = LoggingConfig {
        filter_directives: vec!["sessman_core=notalevel".to_string()],
        ..LoggingConfig::default()
    };
    assert!(matches!(
        init_logging(&config),
        Err(CoreError::Logging { .. })
    ));
}
