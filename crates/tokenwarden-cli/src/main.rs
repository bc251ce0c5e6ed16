//! tokenwarden - a terminal host for a managed API session.
//!
//! Logs in, keeps the session in the configured store, and lets you call
//! the API with the bearer credential refreshed for you.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenwarden_core::auth::{self, Credential, TerminationReason};
use tokenwarden_core::config::StorageBackend;
use tokenwarden_core::{ApiClient, Config};

/// Directory for an additional log file, if set
const ENV_LOG_DIR: &str = "TOKENWARDEN_LOG_DIR";

const USAGE: &str = "\
Usage: tokenwarden <command>

Commands:
  login [username]      Log in and store the session
  status                Show the stored session
  get <path>            GET a path under the API base URL
  post <path> <json>    POST a JSON body to a path
  logout                End the session";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::never(dir, "tokenwarden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load()?;
    if config.storage == StorageBackend::Memory {
        warn!("Using in-memory session storage; the session ends with this process");
    }
    let store = auth::open_store(&config)?;
    let client = ApiClient::new(
        &config,
        store,
        Arc::new(|reason: TerminationReason, redirect: &str| {
            eprintln!("Session ended ({}). Continue at {}", reason, redirect);
        }),
    )?;

    match command.as_str() {
        "login" => {
            let username = match args.get(1).or(config.last_username.as_ref()) {
                Some(username) => username.clone(),
                None => prompt("Username: ")?,
            };
            let password = rpassword::prompt_password("Password: ")
                .context("Failed to read password")?;

            let session = client.login(&username, &password).await?;
            info!(username = %username, "Login complete");
            println!(
                "Logged in as {} ({})",
                username,
                session.role.as_deref().unwrap_or("no role")
            );

            config.last_username = Some(username);
            config.save()?;
        }
        "status" => match client.session()? {
            Some(session) => {
                let access = Credential::parse(&session.access_token);
                println!("Role: {}", session.role.as_deref().unwrap_or("none"));
                match access.expires_at {
                    Some(expiry) => {
                        let remaining = access.time_until_expiry(Utc::now());
                        println!(
                            "Access credential expires {} ({}s)",
                            expiry.to_rfc3339(),
                            remaining.num_seconds()
                        );
                    }
                    None => println!("Access credential expiry unknown"),
                }
            }
            None => println!("Not logged in"),
        },
        "get" => {
            let path = args.get(1).context("get needs a path")?;
            let body: serde_json::Value = client.get_json(path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        "post" => {
            let path = args.get(1).context("post needs a path")?;
            let raw = args.get(2).context("post needs a JSON body")?;
            let payload: serde_json::Value =
                serde_json::from_str(raw).context("Body is not valid JSON")?;
            let body: serde_json::Value = client.post_json(path, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        "logout" => client.logout(),
        _ => eprintln!("{}", USAGE),
    }

    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
