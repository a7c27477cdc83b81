//! HRDS Desktop - Main Entry Point
//!
//! Headless companion runner for the Harun Regional Database System:
//! restores the persisted session and primes the registry snapshot so
//! a frontend shell can attach to a ready core.

use anyhow::Context;
use tracing::{info, warn};

use hrds_lib::{auth::Redirect, commands, logging, AppState};

const DEFAULT_API_URL: &str = "http://localhost:3000";

fn main() -> anyhow::Result<()> {
    logging::init();
    info!("HRDS Desktop starting...");

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let api_base_url =
        std::env::var("HRDS_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    info!("Using registry service at {}", api_base_url);

    let state = AppState::new(&api_base_url);

    match commands::restore_session(&state).await {
        Redirect::Dashboard => {
            let session = state.session.current();
            if let Some(identity) = &session.identity {
                info!("Signed in as {}", identity.name);
            }
            match commands::load_people(&state).await {
                Ok(people) => info!("Registry snapshot ready: {} records", people.len()),
                Err(e) => warn!("Registry snapshot unavailable: {}", e),
            }
        }
        Redirect::Login => {
            let session = state.session.current();
            match session.status_message {
                Some(message) => info!("Not authenticated: {}", message),
                None => info!("Not authenticated; show the login surface"),
            }
        }
    }

    Ok(())
}
