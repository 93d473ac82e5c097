//! docflow - command line access to the anonymous document-API session.
//!
//! Acquires (or reuses) the anonymous user's session, forces a fresh login,
//! or forgets the stored anonymous user.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docflow_core::config::{Config, APP_NAME};
use docflow_core::{
    AnonymousSessionManager, AuthError, CredentialStore, KeyringCredentialStore, Session, SessionManager,
    UserCenterClient,
};

const USAGE: &str = "\
Usage: docflow [COMMAND]

Commands:
  session   Print the current session, logging in if needed (default)
  login     Force a fresh login of the anonymous user
  forget    Delete the stored anonymous user credentials
  help      Show this message

Configuration is read from the config file and DOCFLOW_* environment
variables (a .env file is honoured). Set RUST_LOG to control logging.";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = tracing_appender::non_blocking(io::stderr());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let command = std::env::args().nth(1).unwrap_or_else(|| "session".to_string());
    let config = Config::load()?.with_env_overrides();
    let store = Arc::new(
        KeyringCredentialStore::new(APP_NAME).context("Failed to open the keychain")?,
    );

    match command.as_str() {
        "session" => {
            let manager = session_manager(&config, store)?;
            let session = manager
                .get_session()
                .await
                .map_err(|e| session_error(e, "Failed to get a session"))?;
            print_session(&session);
        }
        "login" => {
            let manager = session_manager(&config, store)?;
            let session = manager
                .login_user()
                .await
                .map_err(|e| session_error(e, "Failed to log in"))?;
            print_session(&session);
        }
        "forget" => {
            store
                .delete_user_credentials()
                .context("Failed to delete stored credentials")?;
            info!("Stored credentials deleted");
            eprintln!("Anonymous user credentials deleted.");
        }
        "help" | "--help" | "-h" => println!("{}", USAGE),
        other => {
            eprintln!("{}", USAGE);
            anyhow::bail!("Unknown command: {}", other);
        }
    }

    Ok(())
}

fn session_manager(config: &Config, store: Arc<KeyringCredentialStore>) -> Result<Arc<dyn SessionManager>> {
    let identity = UserCenterClient::new(
        config.user_center_url()?,
        config.client_id()?,
        config.client_secret()?,
    )
    .context("Failed to create identity service client")?;

    let manager = AnonymousSessionManager::builder()
        .email_domain(config.email_domain()?)
        .identity_provider(Arc::new(identity))
        .credential_store(store)
        .build()?;
    Ok(Arc::new(manager))
}

/// Point the user at `forget` when the identity service keeps rejecting the
/// stored user even after it was recreated.
fn session_error(err: AuthError, action: &'static str) -> anyhow::Error {
    if err.is_invalid_grant() {
        anyhow::Error::new(err)
            .context("The identity service rejected the anonymous user; run `docflow forget` and try again")
    } else {
        anyhow::Error::new(err).context(action)
    }
}

fn print_session(session: &Session) {
    println!(
        "Session valid until {} ({} minutes left)",
        session.expiry_time().with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
        session.minutes_until_expiry()
    );
}
