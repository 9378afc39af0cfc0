//! Storefront CLI - talk to the storefront API with a self-renewing session.
//!
//! Commands:
//!   storefront login            authenticate and persist the session
//!   storefront logout           end the session and forget the tokens
//!   storefront status           show the persisted session
//!   storefront get <path>       GET a path and print the JSON response
//!   storefront watch            keep the session alive and print lifecycle events

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storefront_core::auth::{SessionEvent, SessionManager, TerminationReason};
use storefront_core::{ApiError, Config};

// ============================================================================
// Constants
// ============================================================================

/// Directory for a daily-rotated log file, in addition to stderr
const LOG_DIR_ENV: &str = "STOREFRONT_LOG_DIR";

const USAGE: &str = "usage: storefront <login|logout|status|get <path>|watch>";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must outlive `main`.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "storefront.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
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
        bail!(USAGE);
    };

    let mut config = Config::load()?;
    info!(api = %config.api_base_url, command = %command, "Storefront CLI starting");
    let manager = SessionManager::connect(&config)?;

    match command.as_str() {
        "login" => login(&manager, &mut config).await,
        "logout" => {
            manager.logout();
            eprintln!("Logged out.");
            Ok(())
        }
        "status" => status(&manager),
        "get" => {
            let path = args.get(1).context(USAGE)?;
            get(&manager, path).await
        }
        "watch" => watch(&manager).await,
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

async fn login(manager: &SessionManager, config: &mut Config) -> Result<()> {
    let username = prompt_username(config.last_username.as_deref())?;
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    manager.login(&username, &password).await?;

    config.last_username = Some(username.clone());
    config.save()?;

    let info = manager.info();
    eprintln!("Logged in as {} (access token expires in {}).", username, info.expires_in_display());
    Ok(())
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(name) => eprint!("Username [{}]: ", name),
        None => eprint!("Username: "),
    }
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let entered = line.trim();
    match (entered.is_empty(), last) {
        (false, _) => Ok(entered.to_string()),
        (true, Some(name)) => Ok(name.to_string()),
        (true, None) => bail!("username is required"),
    }
}

fn status(manager: &SessionManager) -> Result<()> {
    let restored = manager.restore();
    let info = manager.info();
    println!("State:          {:?}", info.state);
    println!("Access token:   {}", info.expires_in_display());
    if let Some(refresh) = info.refresh_expires_in {
        println!("Refresh token:  {}h remaining", refresh.num_hours().max(0));
    }
    if !restored {
        println!("Run `storefront login` to start a session.");
    }
    Ok(())
}

async fn get(manager: &SessionManager, path: &str) -> Result<()> {
    if !manager.restore() {
        bail!("Not logged in. Run `storefront login` first.");
    }

    let api = manager.api_client();
    match api.get::<serde_json::Value>(path).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) if e.requires_login() => {
            bail!("{} Run `storefront login` again.", e)
        }
        Err(ApiError::RenewalUnavailable(reason)) => {
            bail!("Could not renew the session right now ({}). Try again shortly.", reason)
        }
        Err(e) => Err(e.into()),
    }
}

/// Keep the session alive in the foreground until it ends or ctrl-c.
async fn watch(manager: &SessionManager) -> Result<()> {
    let mut events = manager.subscribe();
    if !manager.restore() {
        bail!("Not logged in. Run `storefront login` first.");
    }
    eprintln!("Session active; access token expires in {}. Ctrl-C to stop.", manager.info().expires_in_display());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Authenticated) => eprintln!("Session authenticated."),
                Ok(SessionEvent::Terminated { reason: TerminationReason::RenewalRejected }) => {
                    eprintln!("Session ended: the server refused to renew it. Log in again.");
                    return Ok(());
                }
                Ok(SessionEvent::Terminated { reason }) => {
                    eprintln!("Session ended ({:?}).", reason);
                    return Ok(());
                }
                // Lagged: only the latest state matters
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopped; the session is still saved.");
                return Ok(());
            }
        }
    }
}
