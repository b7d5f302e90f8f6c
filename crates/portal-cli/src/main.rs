//! Portal CLI
//!
//! Drives the portal session core against a real API from the terminal.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use portal_session::{
    ApiRequest, Config, CredentialStore, HistoryNavigator, HttpTransport, LocalStorage, Method,
    SessionError, SessionManager,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Portal - session restoration and gated API access
///
/// Restores the stored session the way the portal client does on startup,
/// then runs the requested command through the request gateway.
#[derive(Parser, Debug)]
#[command(name = "portal")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: portal.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Override the API base URL
    #[arg(long, value_name = "URL", global = true)]
    api_base_url: Option<String>,

    /// Override the storage file
    #[arg(long, value_name = "FILE", global = true)]
    storage_file: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore the stored session and print where the app would land
    Restore,

    /// Log in with an OTP verification payload
    Login {
        /// JSON body for the OTP verification endpoint
        #[arg(long, value_name = "JSON")]
        otp_payload: String,
    },

    /// Restore the session, then log out
    Logout,

    /// Restore the session, then send a gated request
    Request {
        /// HTTP method
        #[arg(value_name = "METHOD")]
        method: String,

        /// Path relative to the API base URL
        #[arg(value_name = "PATH")]
        path: String,

        /// JSON request body
        #[arg(long, value_name = "JSON")]
        body: Option<String>,

        /// Extra header, repeatable
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,
    },

    /// Print the stored credential (token redacted)
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.downcast_ref::<SessionError>().is_some_and(SessionError::is_transient) {
                eprintln!("\nSuggestion: The failure looks temporary, run the command again");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(ref api_base_url) = args.api_base_url {
        config.api_base_url.clone_from(api_base_url);
    }
    if let Some(ref storage_file) = args.storage_file {
        config.storage_file.clone_from(storage_file);
    }

    // Re-validate after overrides
    config.validate()?;

    let storage = LocalStorage::open(&config.storage_file).map_err(|e| {
        anyhow::anyhow!(
            "Failed to open storage file '{}': {e}\n\nSuggestion: Delete the file to start with an empty session",
            config.storage_file
        )
    })?;

    if matches!(args.command, Command::Status) {
        let credential = CredentialStore::new(storage).load().redacted();
        println!("{}", serde_json::to_string_pretty(&credential)?);
        return Ok(());
    }

    let transport = Arc::new(HttpTransport::new(&config)?);
    let navigator = HistoryNavigator::new();
    let manager = SessionManager::new(config, storage, transport, Arc::new(navigator.clone()));
    let device_id = manager.mount()?;
    tracing::info!(device_id = %device_id, "Device ready");

    match args.command {
        Command::Restore => {
            let result = manager.restore_session().await;
            print_session(&manager, &navigator);
            result?;
        }
        Command::Login { otp_payload } => {
            let payload = parse_json("--otp-payload", &otp_payload)?;
            let user = manager.login_with_otp(payload).await?;
            println!("Logged in as {} ({})", user.id, user.role.role_name);
            print_session(&manager, &navigator);
        }
        Command::Logout => {
            // Logout clears local state even when the stored session is dead
            if let Err(e) = manager.restore_session().await {
                tracing::warn!(error = %e, "Restoration failed before logout");
            }
            if manager.logout().await? {
                println!("Logged out");
            } else {
                println!("Logout already in progress");
            }
        }
        Command::Request {
            method,
            path,
            body,
            headers,
        } => {
            manager.restore_session().await?;
            let method = Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|_| {
                anyhow::anyhow!(
                    "Invalid HTTP method '{method}'\n\nSuggestion: Use GET, POST, PUT, PATCH or DELETE"
                )
            })?;
            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                request = request.with_json(parse_json("--body", &body)?);
            }
            for header in &headers {
                let (name, value) = parse_header(header)?;
                request = request.with_header(name, value);
            }
            let response = manager.gateway().send(request).await?;
            println!("Status: {}", response.status);
            println!("{}", serde_json::to_string_pretty(&response.body)?);
        }
        Command::Status => {}
    }

    Ok(())
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        anyhow::anyhow!("Invalid JSON for {flag}: {e}\n\nSuggestion: Quote the value, e.g. '{{\"otp\":\"1234\"}}'")
    })
}

fn parse_header(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once(':')
        .map(|(name, value)| (name.trim(), value.trim()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("Invalid header '{raw}'\n\nSuggestion: Use NAME:VALUE, e.g. 'X-Trace:abc'")
        })
}

/// Prints the session phase, user and navigation target.
fn print_session(manager: &SessionManager, navigator: &HistoryNavigator) {
    let state = manager.state();
    println!("Phase: {}", state.phase);
    match &state.user {
        Some(user) => println!("User: {} ({})", user.id, user.role.role_name),
        None => println!("User: none"),
    }
    if let Some(target) = navigator.current() {
        println!("Navigate to: {target}");
    }
}
