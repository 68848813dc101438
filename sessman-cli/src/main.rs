//! Sessman CLI - Command-line interface for the session store
//!
//! Runs one session operation per invocation and prints the JSON response body

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use sessman_core::{init_logging, CoreError, ErrorContext, SessmanConfig};
use sessman_store::{
    ResponseStatus, SessionData, SessionError, SessionManager, SessionRequest, SessionResponse,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "sessman")]
#[command(about = "Server-side session store with SQLite and MongoDB backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and print its id
    New {
        /// Initial payload as a JSON object
        #[arg(short, long)]
        data: Option<String>,

        /// Address the session is bound to
        #[arg(long)]
        client_ip: String,
    },

    /// Print a live session's payload and extend its life
    Get {
        #[arg(short, long)]
        session_id: String,

        #[arg(long)]
        client_ip: String,
    },

    /// Replace a live session's payload
    Update {
        #[arg(short, long)]
        session_id: String,

        #[arg(long)]
        client_ip: String,

        /// New payload as a JSON object
        #[arg(short, long)]
        data: String,
    },

    /// Run one reaper pass over the SQLite store
    Sweep,

    /// Configuration management
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Initialize default configuration
        #[arg(long)]
        init: bool,

        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration before logging so the file can configure the subscriber
    let config_path = cli.config.clone().or_else(find_config_file);
    let mut config = SessmanConfig::load(config_path.as_deref())?;

    // stdout is reserved for response bodies
    config.logging.log_to_stderr = true;
    if cli.verbose {
        config.logging.level = "debug".to_string();
        config
            .logging
            .filter_directives
            .retain(|directive| !directive.starts_with("sessman_"));
    } else {
        config.logging.level = "warn".to_string();
        config.logging.filter_directives.clear();
    }

    init_logging(&config.logging).map_err(|e| CoreError::Config {
        message: format!("Failed to initialize logging: {}", e),
        source: Some(Box::new(e)),
        context: ErrorContext::new("cli")
            .with_operation("init_logging")
            .with_suggestion("Check the [logging] section of the configuration"),
    })?;

    info!("Starting sessman CLI v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => debug!("Using configuration file {}", path.display()),
        None => debug!("No configuration file found, using defaults and environment"),
    }

    match cli.command {
        Commands::New { data, client_ip } => {
            let mut request = SessionRequest::new("new").with_client_ip(client_ip);
            if let Some(data) = data {
                request = request.with_data(parse_data(&data)?);
            }
            run_request(config, request).await
        }
        Commands::Get {
            session_id,
            client_ip,
        } => {
            let request = SessionRequest::new("get")
                .with_session_id(session_id)
                .with_client_ip(client_ip);
            run_request(config, request).await
        }
        Commands::Update {
            session_id,
            client_ip,
            data,
        } => {
            let request = SessionRequest::new("update")
                .with_session_id(session_id)
                .with_client_ip(client_ip)
                .with_data(parse_data(&data)?);
            run_request(config, request).await
        }
        Commands::Sweep => handle_sweep(config).await,
        Commands::Config {
            show,
            init,
            validate,
        } => handle_config(config, config_path.as_deref(), show, init, validate).await,
    }
}

/// Default config locations, first match wins
fn find_config_file() -> Option<PathBuf> {
    let default_paths = [
        dirs::config_dir().map(|d| d.join("sessman").join("config.toml")),
        dirs::home_dir().map(|d| d.join(".sessman").join("config.toml")),
        Some(PathBuf::from("sessman.toml")),
    ];

    default_paths.into_iter().flatten().find(|path| path.exists())
}

fn parse_data(raw: &str) -> anyhow::Result<SessionData> {
    serde_json::from_str(raw).with_context(|| format!("--data must be a JSON object, got {}", raw))
}

fn exit_code(response: &SessionResponse) -> ExitCode {
    match response.status {
        ResponseStatus::Ok => ExitCode::SUCCESS,
        ResponseStatus::Declined => ExitCode::from(1),
        ResponseStatus::Failed => ExitCode::from(2),
    }
}

async fn execute(config: SessmanConfig, request: SessionRequest) -> SessionResponse {
    let manager = SessionManager::new(config);
    let response = manager.handle(request).await;
    manager.terminate().await;
    response
}

async fn run_request(config: SessmanConfig, request: SessionRequest) -> anyhow::Result<ExitCode> {
    let response = execute(config, request).await;

    if let Some(cookie) = &response.cookie {
        eprintln!("Set-Cookie: {}", cookie.to_header_value());
    }
    println!("{}", serde_json::to_string_pretty(&response.body)?);

    Ok(exit_code(&response))
}

#[cfg(feature = "sqlite")]
async fn handle_sweep(config: SessmanConfig) -> anyhow::Result<ExitCode> {
    use sessman_core::{log_operation_error, log_operation_start, log_operation_success, BackendKind};
    use sessman_store::{system_clock, RelationalConfig, SqliteBackend};

    if config.session.backend != BackendKind::Relational {
        return Err(anyhow!(
            "sweep only applies to the sqlite backend; the {} backend expires sessions itself",
            config.session.backend
        ));
    }

    let relational = RelationalConfig::from_config(&config)?.without_reaper();
    let backend = SqliteBackend::open(relational, system_clock()).await?;
    log_operation_start!("session.sweep", database = %backend.database().display());

    let response = match backend.purge_expired().await {
        Ok(deleted) => {
            let remaining = backend.count().await?;
            log_operation_success!("session.sweep", deleted = deleted, remaining = remaining);
            info!("Sweep removed {} expired sessions", deleted);
            serde_json::json!({ "deleted": deleted, "remaining": remaining })
        }
        Err(e) => {
            log_operation_error!("session.sweep", e, category = e.category());
            let response = SessionResponse::from_error(&e, "session.sweep");
            println!("{}", serde_json::to_string_pretty(&response.body)?);
            return Ok(exit_code(&response));
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(not(feature = "sqlite"))]
async fn handle_sweep(_config: SessmanConfig) -> anyhow::Result<ExitCode> {
    Err(anyhow!(SessionError::invalid_argument(
        "backend",
        "sqlite support is not compiled into this build"
    )))
}

async fn handle_config(
    config: SessmanConfig,
    config_path: Option<&Path>,
    show: bool,
    init: bool,
    validate: bool,
) -> anyhow::Result<ExitCode> {
    if init {
        let config_dir = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|d| d.join(".config")))
            .ok_or_else(|| anyhow!("Cannot determine a configuration directory"))?
            .join("sessman");

        tokio::fs::create_dir_all(&config_dir).await?;
        let path = config_dir.join("config.toml");
        if path.exists() {
            return Err(anyhow!("Configuration already exists at {}", path.display()));
        }

        SessmanConfig::default().save_to_file(&path)?;
        println!("Configuration initialized at: {}", path.display());
        println!("Set sqlite.database (or the mongodb section) before first use.");
    }

    if show {
        let mut shown = config.clone();
        if shown.mongodb.password.is_some() {
            shown.mongodb.password = Some("<redacted>".to_string());
        }
        if let Some(path) = config_path {
            println!("# loaded from {}", path.display());
        }
        println!("{}", toml::to_string_pretty(&shown)?);
    }

    if validate {
        match config.validate() {
            Ok(()) => println!("Configuration is valid"),
            Err(e) => {
                e.log();
                println!("Configuration validation failed: {}", e);
                return Ok(ExitCode::from(1));
            }
        }
    }

    if !(init || show || validate) {
        return Err(anyhow!(SessionError::missing("--init, --show or --validate")));
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_session_commands() {
        let cli = Cli::try_parse_from([
            "sessman",
            "update",
            "--session-id",
            "abc",
            "--client-ip",
            "10.0.0.5",
            "--data",
            r#"{"lang":"fr"}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Update {
                session_id,
                client_ip,
                data,
            } => {
                assert_eq!(session_id, "abc");
                assert_eq!(client_ip, "10.0.0.5");
                assert_eq!(parse_data(&data).unwrap().get("lang").unwrap(), "fr");
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn test_new_requires_client_ip() {
        assert!(Cli::try_parse_from(["sessman", "new"]).is_err());
    }

    #[test]
    fn test_data_must_be_an_object() {
        assert!(parse_data("[1, 2]").is_err());
        assert!(parse_data("not json").is_err());
        assert!(parse_data("{}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_against_sqlite_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SessmanConfig::default();
        config.sqlite.database = Some(dir.path().join("cli.db").to_string_lossy().into_owned());

        let missing = execute(
            config.clone(),
            SessionRequest::new("get")
                .with_session_id("missing")
                .with_client_ip("10.0.0.5"),
        )
        .await;
        assert_eq!(missing.status, ResponseStatus::Declined);

        let created = execute(
            config.clone(),
            SessionRequest::new("new").with_client_ip("10.0.0.5"),
        )
        .await;
        assert!(created.is_ok());
        let session_id = created.body["session_id"].as_str().unwrap().to_string();

        let fetched = execute(
            config,
            SessionRequest::new("get")
                .with_session_id(session_id)
                .with_client_ip("10.0.0.5"),
        )
        .await;
        assert!(fetched.is_ok());
    }
}
